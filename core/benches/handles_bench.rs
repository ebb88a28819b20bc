use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use cinder_core::{EmulatedMemory, HandleTable, Managed};

fn acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("handles");

    for count in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::new("acquire_release", count), &count, |b, &count| {
            let memory = EmulatedMemory::new();
            let table = HandleTable::new();
            let objects: Vec<Managed> = (0..count).map(|i| Managed::buffer(vec![i as u8])).collect();
            b.iter(|| {
                let addresses: Vec<_> = objects
                    .iter()
                    .map(|object| table.acquire(&memory, object.clone(), false))
                    .collect();
                for address in addresses {
                    table.release(&memory, address).unwrap();
                }
            });
        });
    }

    group.bench_function("resolve_hot", |b| {
        let memory = EmulatedMemory::new();
        let table = HandleTable::new();
        let object = Managed::buffer(vec![42]);
        let address = table.acquire(&memory, object, false);
        b.iter(|| table.resolve(address).unwrap());
    });

    group.finish();
}

criterion_group!(benches, acquire_release);
criterion_main!(benches);
