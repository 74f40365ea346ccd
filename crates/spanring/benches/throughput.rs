use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use spanring::SpanBuffer;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const RECORD_LEN: usize = 64;
const RECORDS: usize = 10_000;

fn single_producer(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_producer");
    group.throughput(Throughput::Bytes((RECORD_LEN * RECORDS) as u64));
    group.bench_function("add_allot_consume", |b| {
        let buffer = SpanBuffer::with_capacity(1 << 20);
        let record = [7u8; RECORD_LEN];
        b.iter(|| {
            for _ in 0..RECORDS {
                assert!(buffer.add(RECORD_LEN, |w| w.write_all(&record)));
            }
            let allotted = buffer.allot();
            buffer.consume(allotted);
        });
    });
    group.finish();
}

fn contended_producers(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_producers");
    group.throughput(Throughput::Bytes((RECORD_LEN * RECORDS) as u64));
    group.bench_function("four_producers_one_consumer", |b| {
        b.iter(|| {
            let buffer = Arc::new(SpanBuffer::with_capacity(1 << 16));
            let done = Arc::new(AtomicBool::new(false));
            let record = [7u8; RECORD_LEN];

            let producers: Vec<_> = (0..4)
                .map(|_| {
                    let buffer = Arc::clone(&buffer);
                    std::thread::spawn(move || {
                        for _ in 0..RECORDS / 4 {
                            while !buffer.add(RECORD_LEN, |w| w.write_all(&record)) {
                                std::hint::spin_loop();
                            }
                        }
                    })
                })
                .collect();

            let consumer = {
                let buffer = Arc::clone(&buffer);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    let mut total = 0usize;
                    while !done.load(Ordering::Acquire) || total < RECORD_LEN * RECORDS {
                        let allotted = buffer.allot();
                        if allotted == 0 {
                            std::hint::spin_loop();
                            continue;
                        }
                        total += allotted;
                        buffer.consume(allotted);
                    }
                })
            };

            for producer in producers {
                producer.join().unwrap();
            }
            done.store(true, Ordering::Release);
            consumer.join().unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, single_producer, contended_producers);
criterion_main!(benches);
