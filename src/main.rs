use slabvec_rs::{SmallVec, thread_pool_stats};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut rows: Vec<SmallVec<u64, 4>> = Vec::new();
    let count = 100 * 1000;
    for i in 0..count {
        let mut row = SmallVec::new();
        for j in 0..(i % 40) {
            row.push(j);
        }
        rows.push(row);
    }
    info!(stats = ?thread_pool_stats(), "filled {} rows", rows.len());

    for row in rows.iter_mut() {
        while row.len() > 1 {
            row.erase(0);
        }
    }
    assert!(rows.iter().all(|row| row.is_inline()));
    info!(stats = ?thread_pool_stats(), "drained rows back to their inline buffers");

    let mut names: SmallVec<String> = SmallVec::new();
    for word in ["slab", "pool", "small", "vector"] {
        names.push(word.to_owned());
    }
    names.insert(1, "allocator".to_owned());
    assert_eq!(names.join(" "), "slab allocator pool small vector");

    drop(rows);
    drop(names);
    let trimmed = slabvec_rs::with_thread_pool(|pool| pool.trim()).unwrap_or_default();
    info!(trimmed, stats = ?thread_pool_stats(), "released empty pages");
}
