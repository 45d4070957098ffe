use cothread::Context;

fn main() {
    let context = Context::<u32>::new();
    let generator = context
        .create_child_thread(|context, limit| {
            for i in 0..limit.unwrap_or_default() {
                context.yield_now(i);
            }
        })
        .unwrap();

    while let Some(i) = context.resume(generator, 20) {
        print!("{i} ");
    }
    println!();
}
