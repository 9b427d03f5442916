//! Timer cancellation: a timer armed for t+4.5s is cancelled twice, once
//! before it fires and once (harmlessly) after.

use reactor_net::event_loop::EventLoop;

fn main() {
    env_logger::init();

    let loop_ = EventLoop::new();

    let id = loop_.run_after(4.5, || println!("once4.5"));

    let loop_for_cancel = loop_.clone();
    loop_.run_after(4.2, move || {
        println!("cancelling at t+4.2");
        loop_for_cancel.cancel(id);
    });

    let loop_for_cancel_again = loop_.clone();
    loop_.run_after(4.8, move || {
        println!("cancelling (again, no-op) at t+4.8");
        loop_for_cancel_again.cancel(id);
    });

    let loop_for_quit = loop_.clone();
    loop_.run_after(5.0, move || loop_for_quit.quit());

    loop_.run();
    println!("done, \"once4.5\" above would be a bug");
}
