//! Property tests for the byte ring: arbitrary add/consume interleavings
//! must behave like a FIFO queue of records.

use proptest::collection::vec;
use proptest::prelude::*;
use spanring::SpanBuffer;
use std::collections::VecDeque;
use std::io::Write;

#[derive(Debug, Clone)]
enum Op {
    /// Add a record of the given length filled with the given byte.
    Add { len: usize, fill: u8 },
    /// Allot everything readable, verify it, consume it.
    Drain,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..48, any::<u8>()).prop_map(|(len, fill)| Op::Add { len, fill }),
        1 => Just(Op::Drain),
    ]
}

proptest! {
    #[test]
    fn ring_behaves_like_a_fifo_of_records(ops in vec(op_strategy(), 1..200)) {
        let buffer = SpanBuffer::with_capacity(256);
        let mut model: VecDeque<Vec<u8>> = VecDeque::new();
        let mut model_bytes = 0usize;

        for op in ops {
            match op {
                Op::Add { len, fill } => {
                    let record = vec![fill; len];
                    let added = buffer.add(len, |w| w.write_all(&record));
                    // The ring may refuse only when it genuinely lacks space.
                    if added {
                        model_bytes += len;
                        model.push_back(record);
                        prop_assert!(model_bytes <= buffer.capacity());
                    } else {
                        prop_assert!(model_bytes + len > buffer.capacity());
                    }
                    prop_assert_eq!(buffer.size(), model_bytes);
                }
                Op::Drain => {
                    let allotted = buffer.allot();
                    prop_assert_eq!(allotted, model_bytes);
                    let (first, second) = buffer.allotment();
                    let mut joined = first.to_vec();
                    joined.extend_from_slice(second);
                    let expected: Vec<u8> = model.iter().flatten().copied().collect();
                    prop_assert_eq!(joined, expected);
                    buffer.consume(allotted);
                    model.clear();
                    model_bytes = 0;
                }
            }
        }

        // Whatever is left still reads back intact.
        let allotted = buffer.allot();
        prop_assert_eq!(allotted, model_bytes);
        let (first, second) = buffer.allotment();
        let mut joined = first.to_vec();
        joined.extend_from_slice(second);
        let expected: Vec<u8> = model.iter().flatten().copied().collect();
        prop_assert_eq!(joined, expected);
    }
}
