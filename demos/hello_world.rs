use linked_heap::UnixAllocator;

#[global_allocator]
static A: UnixAllocator = UnixAllocator::new();

fn main() {
    println!("Hello, World!");

    let (validity, stats) = A.stats();
    println!("    Validity: {:?}", validity);
    println!("    Stats:    {:?}", stats);
}
