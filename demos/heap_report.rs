//! Builds a small heap over a plain buffer, fragments it, and prints what a
//! snapshot sees before and after defragmenting.
//!
//! Run with `RUST_LOG=trace` to watch every split, growth and merge.

use linked_heap::{HeapConfig, RawAlloc, ToyHeap};

fn main() {
    env_logger::init();

    let mut buffer = vec![0u8; 16 * 1024];
    let config = HeapConfig::new().check_release(true);
    let mut heap = RawAlloc::with_config(ToyHeap::new(&mut buffer), config);

    let sizes = [100, 200, 48, 48, 48, 1000, 16, 320];
    let pointers: Vec<_> = sizes
        .iter()
        .map(|&size| heap.allocate(size).expect("the toy heap has room"))
        .collect();

    unsafe {
        heap.release(pointers[0].as_ptr());
        heap.release(pointers[2].as_ptr());
        heap.release(pointers[4].as_ptr());
        heap.release(pointers[3].as_ptr());
    }

    match heap.snapshot() {
        Ok(report) => print!("Before defragmenting:\n{}", report),
        Err(err) => println!("No report: {}", err),
    }

    let merges = heap.defragment();
    println!("\nDefragmenting merged {} blocks\n", merges);

    match heap.snapshot() {
        Ok(report) => print!("After defragmenting:\n{}", report),
        Err(err) => println!("No report: {}", err),
    }

    let (validity, stats) = heap.stats();
    println!("\nValidity: {:?}", validity);
    println!("Stats:    {:?}", stats);
}
