use std::sync::Arc;

use accel_alloc::base::cpu::CpuAllocator;
use accel_alloc::buddy::BuddyAllocator;
use accel_alloc::driver::mock::MockDriver;
use accel_alloc::driver::DeviceDriver;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn cpu_buddy() -> BuddyAllocator<CpuAllocator> {
    let driver: Arc<dyn DeviceDriver> = Arc::new(MockDriver::single(0));
    let base = CpuAllocator::new(driver.clone(), false);
    BuddyAllocator::new(base, driver, 256, 1 << 24, false, None)
}

fn bench_malloc_free_pair(c: &mut Criterion) {
    let mut group = c.benchmark_group("malloc_free_pair");
    for size in [64usize, 1024, 65536] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let buddy = cpu_buddy();
            b.iter(|| {
                let p = buddy.malloc(size).unwrap();
                buddy.free(black_box(p));
            });
        });
    }
    group.finish();
}

fn bench_sustained_allocation(c: &mut Criterion) {
    c.bench_function("sustained_allocation_1024", |b| {
        let buddy = cpu_buddy();
        let mut live = Vec::new();
        b.iter(|| {
            live.push(buddy.malloc(1024).unwrap());
            if live.len() > 64 {
                buddy.free(live.remove(0));
            }
        });
        for p in live {
            buddy.free(p);
        }
    });
}

criterion_group!(benches, bench_malloc_free_pair, bench_sustained_allocation);
criterion_main!(benches);
