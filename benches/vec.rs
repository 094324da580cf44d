use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use slabvec_rs::{HeapAlloc, SmallVec};

type SlabVec = SmallVec<u64, 100>;
type HeapVec = SmallVec<u64, 100, HeapAlloc<u64>>;

pub fn bench_vec(c: &mut Criterion) {
    // helper: bench a push loop against a freshly built container
    fn bench_push<V: Extend<u64>>(c: &mut Criterion, name: &str, make: fn() -> V, count: u64) {
        c.bench_function(name, |b| {
            b.iter_batched(
                make,
                |mut vec| {
                    for i in 0..count {
                        vec.extend(Some(black_box(i)));
                    }
                    black_box(vec)
                },
                BatchSize::SmallInput,
            )
        });
    }

    for count in [10, 100, 1000] {
        bench_push(c, &format!("vec_push_u64_{count}"), Vec::<u64>::new, count);
        bench_push(
            c,
            &format!("small_vec_slab_push_u64_{count}"),
            SlabVec::new,
            count,
        );
        bench_push(
            c,
            &format!("small_vec_heap_push_u64_{count}"),
            HeapVec::new,
            count,
        );
    }

    c.bench_function("small_vec_churn_string", |b| {
        b.iter(|| {
            let mut vec: SmallVec<String, 4> = SmallVec::new();
            for i in 0..64 {
                vec.insert(i / 2, i.to_string());
            }
            while !vec.is_empty() {
                vec.erase(vec.len() / 2);
            }
            black_box(vec)
        })
    });

    c.bench_function("vec_churn_string", |b| {
        b.iter(|| {
            let mut vec: Vec<String> = Vec::new();
            for i in 0..64 {
                vec.insert(i / 2, i.to_string());
            }
            while !vec.is_empty() {
                vec.remove(vec.len() / 2);
            }
            black_box(vec)
        })
    });
}

criterion_group!(benches, bench_vec);
criterion_main!(benches);
