use threadlet::{create_thread, run_all, status, yield_now};

fn main() {
    let handles: Vec<_> = ["hi", "bye", "bye"]
        .into_iter()
        .map(|word| {
            create_thread(move || {
                for round in 1..=3 {
                    println!("{word} {round}");
                    yield_now();
                }
            })
        })
        .collect();

    print!("{}", status());
    println!("switching to first thread");
    run_all(handles);
    println!("back to the main thread");
    print!("{}", status());
}
