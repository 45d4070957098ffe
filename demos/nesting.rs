use cothread::Context;

fn main() {
    let context = Context::<String>::new();

    let outer = context
        .create_child_thread(|context, greeting| {
            println!("[t1] {}", greeting.unwrap_or_default());

            let inner = context
                .create_child_thread(|context, greeting| {
                    println!("[t2] {}", greeting.unwrap_or_default());

                    let n = 10;
                    context
                        .register_destructor(move |_| println!("inside destructor, n = {n}"))
                        .unwrap();

                    for i in 0..n {
                        context.yield_now(format!("inner thread iteration #{i}"));
                    }
                })
                .unwrap();

            while let Some(response) = context.resume(inner, "some string".to_string()) {
                println!("[t1] got '{response}' from t2");
            }
            println!("[t1] t2 is done");
        })
        .unwrap();

    context.resume(outer, "Hello World".to_string());
}
