#![no_main]

use libfuzzer_sys::fuzz_target;
use lunet_core::state::State;
use lunet_core::value::Value;

// Interpret fuzzer bytes as a sequence of table operations interleaved with
// collector steps. Key errors (nil/NaN) are fine; panics are bugs.
fuzz_target!(|data: &[u8]| {
    let mut st = State::new();
    let root = st.new_table(0, 0).unwrap();
    if st.global_set(b"root", root).is_err() {
        return;
    }
    let mut chunks = data.chunks_exact(3);
    for c in &mut chunks {
        let (op, a, b) = (c[0] % 8, c[1], c[2]);
        match op {
            0 => {
                let _ = st.table_set_int(root, a as i64 - 32, Value::number(b as f64));
            }
            1 => {
                let _ = st.table_set(root, Value::number(a as f64 / 4.0), Value::number(b as f64));
            }
            2 => {
                let s = st.new_string(&[a, b]);
                let _ = st.table_set(root, s, Value::number(b as f64));
            }
            3 => {
                let _ = st.table_set_int(root, a as i64 - 32, Value::nil());
            }
            4 => {
                let _ = st.table_get_int(root, a as i64 - 32);
                let _ = st.table_length(root);
            }
            5 => {
                // drive a traversal from the start; mutation in between may
                // have happened, the walk itself must never panic
                let mut key = Value::nil();
                let mut hops = 0;
                while let Ok(Some((k, _))) = st.table_next(root, key) {
                    key = k;
                    hops += 1;
                    if hops > 512 {
                        break;
                    }
                }
            }
            6 => {
                let _ = st.resize_array(root, (a as usize) & 63);
            }
            _ => {
                if a % 2 == 0 {
                    st.gc_single_step();
                } else {
                    st.check_gc();
                }
            }
        }
    }
    st.full_gc();
    st.check_color_invariants();
    st.check_all_current_white();
});
