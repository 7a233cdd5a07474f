use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lunet_core::state::State;
use lunet_core::value::Value;

fn bench_array_insert(c: &mut Criterion) {
    c.bench_function("table_array_insert_1k", |b| {
        b.iter(|| {
            let mut st = State::new();
            let t = st.new_table(0, 0).unwrap();
            for i in 1..=1000i64 {
                st.table_set_int(t, black_box(i), Value::number(i as f64)).unwrap();
            }
            t
        });
    });
}

fn bench_array_lookup(c: &mut Criterion) {
    let mut st = State::new();
    let t = st.new_table(1024, 0).unwrap();
    for i in 1..=1000i64 {
        st.table_set_int(t, i, Value::number(i as f64)).unwrap();
    }
    c.bench_function("table_array_lookup", |b| {
        b.iter(|| st.table_get_int(t, black_box(500)));
    });
}

fn bench_hash_insert_floats(c: &mut Criterion) {
    c.bench_function("table_hash_insert_floats_1k", |b| {
        b.iter(|| {
            let mut st = State::new();
            let t = st.new_table(0, 0).unwrap();
            for i in 0..1000 {
                let k = Value::number(i as f64 + 0.5);
                st.table_set(t, black_box(k), Value::number(i as f64)).unwrap();
            }
            t
        });
    });
}

fn bench_string_key_lookup(c: &mut Criterion) {
    let mut st = State::new();
    let t = st.new_table(0, 64).unwrap();
    let keys: Vec<Value> = (0..64)
        .map(|i| st.new_string(format!("key_{i}").as_bytes()))
        .collect();
    for (i, &k) in keys.iter().enumerate() {
        st.table_set(t, k, Value::number(i as f64)).unwrap();
    }
    c.bench_function("table_string_lookup", |b| {
        b.iter(|| st.table_get_str(t, black_box(keys[32])));
    });
}

fn bench_length(c: &mut Criterion) {
    let mut st = State::new();
    let t = st.new_table(0, 0).unwrap();
    for i in 1..=4096i64 {
        st.table_set_int(t, i, Value::number(1.0)).unwrap();
    }
    c.bench_function("table_length_4k", |b| {
        b.iter(|| st.table_length(black_box(t)));
    });
}

fn bench_iteration(c: &mut Criterion) {
    let mut st = State::new();
    let t = st.new_table(0, 0).unwrap();
    for i in 1..=512i64 {
        st.table_set_int(t, i, Value::number(i as f64)).unwrap();
    }
    c.bench_function("table_iterate_512", |b| {
        b.iter(|| {
            let mut key = Value::nil();
            let mut sum = 0.0;
            while let Some((k, v)) = st.table_next(t, key).unwrap() {
                sum += v.as_number().unwrap_or(0.0);
                key = k;
            }
            sum
        });
    });
}

fn bench_full_gc(c: &mut Criterion) {
    c.bench_function("full_gc_1k_tables", |b| {
        b.iter(|| {
            let mut st = State::new();
            let root = st.new_table(0, 0).unwrap();
            st.global_set(b"root", root).unwrap();
            for i in 1..=500i64 {
                let t = st.new_table(0, 2).unwrap();
                st.table_set_int(root, i, t).unwrap();
            }
            for _ in 0..500 {
                st.new_table(0, 2).unwrap();
            }
            st.full_gc();
            st.mem.totalbytes
        });
    });
}

criterion_group!(
    benches,
    bench_array_insert,
    bench_array_lookup,
    bench_hash_insert_floats,
    bench_string_key_lookup,
    bench_length,
    bench_iteration,
    bench_full_gc,
);
criterion_main!(benches);
