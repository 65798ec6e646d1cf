//! Producer/consumer pipeline on the Weft fiber runtime.
//!
//! A producer fiber queues 100 tasks, yielding after each one so the
//! consumer fiber can drain the queue; the root drives both through its
//! scheduling loop until the producer signals shutdown.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use weft_runtime::{yield_now, Fiber, Runtime};

const RUN_TIMES: i32 = 100;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::init()?;

    let tasks: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    let shutdown = Rc::new(Cell::new(false));

    let consumer = Fiber::spawn({
        let tasks = tasks.clone();
        let shutdown = shutdown.clone();
        move || {
            while !shutdown.get() {
                let task = tasks.borrow_mut().pop();
                match task {
                    Some(task) => {
                        println!("consumed task #{}", task);
                        // Done with this one: let the producer refill.
                        yield_now();
                    }
                    // Nothing queued: hand control back without popping.
                    None => yield_now(),
                }
            }
        }
    })?;

    let producer = Fiber::spawn({
        let tasks = tasks.clone();
        let shutdown = shutdown.clone();
        move || {
            for i in 1..=RUN_TIMES {
                println!("produced task #{}", i);
                tasks.borrow_mut().push(i);
                // Notify the consumer.
                yield_now();
            }
            shutdown.set(true);
        }
    })?;

    rt.schedule(consumer);
    rt.schedule(producer);

    rt.run_until({
        let shutdown = shutdown.clone();
        move || shutdown.get()
    });
    // Let the consumer observe the flag and wind down.
    while rt.tick() > 0 {}

    Ok(())
}
