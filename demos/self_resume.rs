use cothread::Context;

fn main() {
    let context = Context::new();
    let current = context.current();

    let echoed = context.resume(current, "Hello World!").unwrap();
    println!("{echoed}");

    context.switch(current, current);
    println!("{echoed}");
}
