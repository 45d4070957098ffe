use std::cell::Cell;
use std::rc::Rc;

use cothread::{Context, Thread};

const ROUNDS: usize = 5;

fn main() {
    let context = Context::<()>::new();
    let pong: Rc<Cell<Option<Thread>>> = Rc::default();

    let ping = context
        .create_child_thread({
            let pong = pong.clone();
            move |context, _| {
                let ping = context.current();
                let pong = pong.get().unwrap();
                for _ in 0..ROUNDS {
                    println!("ping!");
                    context.switch(ping, pong);
                }
                context.switch(ping, context.root());
            }
        })
        .unwrap();

    pong.set(Some(
        context
            .create_child_thread(move |context, _| {
                let pong = context.current();
                loop {
                    println!("pong!");
                    context.switch(pong, ping);
                }
            })
            .unwrap(),
    ));

    context.switch(context.current(), ping);
}
