//! The transformation rules.
//!
//! Given operations A and B composed against the same document state, the
//! transformer returns (A', B') such that applying A then B' equals applying
//! B then A'. A `None` result is a no-op: the operation was absorbed by its
//! counterpart.

use crate::types::{Operation, OperationBatch};

/// Which side wins position ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// A goes first on ties; B shifts.
    Left,
    /// B goes first on ties; A shifts.
    Right,
}

/// Transform two concurrent operations.
pub fn transform(
    op_a: &Operation,
    op_b: &Operation,
    priority: Priority,
) -> (Option<Operation>, Option<Operation>) {
    use Operation::*;
    match (op_a, op_b) {
        (Insert { .. }, Insert { .. }) => transform_insert_insert(op_a, op_b, priority),
        (Insert { .. }, Delete { .. }) => transform_insert_delete(op_a, op_b),
        (Delete { .. }, Insert { .. }) => {
            let (b_prime, a_prime) = transform_insert_delete(op_b, op_a);
            (a_prime, b_prime)
        }
        (Delete { .. }, Delete { .. }) => transform_delete_delete(op_a, op_b),
        // Retain needs no transformation.
        _ => (Some(op_a.clone()), Some(op_b.clone())),
    }
}

fn transform_insert_insert(
    op_a: &Operation,
    op_b: &Operation,
    priority: Priority,
) -> (Option<Operation>, Option<Operation>) {
    let (Operation::Insert { position: pa, text: ta }, Operation::Insert { position: pb, text: tb }) =
        (op_a, op_b)
    else {
        unreachable!()
    };
    let (pa, pb) = (*pa, *pb);
    let (len_a, len_b) = (ta.chars().count(), tb.chars().count());

    let a_first = match pa.cmp(&pb) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => priority == Priority::Left,
    };

    if a_first {
        (
            Some(Operation::insert(pa, ta.clone())),
            Some(Operation::insert(pb + len_a, tb.clone())),
        )
    } else {
        (
            Some(Operation::insert(pa + len_b, ta.clone())),
            Some(Operation::insert(pb, tb.clone())),
        )
    }
}

fn transform_insert_delete(
    insert_op: &Operation,
    delete_op: &Operation,
) -> (Option<Operation>, Option<Operation>) {
    let (
        Operation::Insert { position: ins_pos, text },
        Operation::Delete { position: del_start, count },
    ) = (insert_op, delete_op)
    else {
        unreachable!()
    };
    let (ins_pos, del_start, count) = (*ins_pos, *del_start, *count);
    let ins_len = text.chars().count();
    let del_end = del_start + count;

    if ins_pos <= del_start {
        // Insert lands before the deleted range; the delete shifts right.
        (
            Some(Operation::insert(ins_pos, text.clone())),
            Some(Operation::delete(del_start + ins_len, count)),
        )
    } else if ins_pos >= del_end {
        // Insert lands after the deleted range; the insert shifts left.
        (
            Some(Operation::insert(ins_pos - count, text.clone())),
            Some(Operation::delete(del_start, count)),
        )
    } else {
        // Insert strictly inside the deleted range: the delete wins. The
        // insert is absorbed and the delete grows to cover the inserted text,
        // so both application orders converge on the plain-delete result.
        (None, Some(Operation::delete(del_start, count + ins_len)))
    }
}

fn transform_delete_delete(
    op_a: &Operation,
    op_b: &Operation,
) -> (Option<Operation>, Option<Operation>) {
    let (
        Operation::Delete { position: a_start, count: a_count },
        Operation::Delete { position: b_start, count: b_count },
    ) = (op_a, op_b)
    else {
        unreachable!()
    };
    let (a_start, a_count, b_start, b_count) = (*a_start, *a_count, *b_start, *b_count);
    let a_end = a_start + a_count;
    let b_end = b_start + b_count;

    // Disjoint: the later delete shifts left by the earlier one's count.
    if a_end <= b_start {
        return (
            Some(Operation::delete(a_start, a_count)),
            Some(Operation::delete(b_start - a_count, b_count)),
        );
    }
    if b_end <= a_start {
        return (
            Some(Operation::delete(a_start - b_count, a_count)),
            Some(Operation::delete(b_start, b_count)),
        );
    }

    // Overlapping: the overlap is credited once. Each side keeps only its
    // non-overlapping portion, anchored at the earlier start.
    let overlap = a_end.min(b_end) - a_start.max(b_start);
    let new_pos = a_start.min(b_start);
    let a_remaining = a_count - overlap;
    let b_remaining = b_count - overlap;

    (
        (a_remaining > 0).then(|| Operation::delete(new_pos, a_remaining)),
        (b_remaining > 0).then(|| Operation::delete(new_pos, b_remaining)),
    )
}

/// Transform two batches: every operation in A against every operation in B.
pub fn transform_batch(
    batch_a: &OperationBatch,
    batch_b: &OperationBatch,
    priority: Priority,
) -> (OperationBatch, OperationBatch) {
    let mut a_ops: Vec<Option<Operation>> = batch_a.operations.iter().cloned().map(Some).collect();
    let mut b_ops: Vec<Option<Operation>> = batch_b.operations.iter().cloned().map(Some).collect();

    for a in a_ops.iter_mut() {
        for b in b_ops.iter_mut() {
            let (Some(op_a), Some(op_b)) = (a.as_ref(), b.as_ref()) else {
                continue;
            };
            let (a_new, b_new) = transform(op_a, op_b, priority);
            *a = a_new;
            *b = b_new;
        }
    }

    (
        batch_a.with_operations(a_ops.into_iter().flatten().collect()),
        batch_b.with_operations(b_ops.into_iter().flatten().collect()),
    )
}

/// Transform a batch against the history it has not seen.
///
/// The submitting user's own historical batches are skipped; history wins
/// position ties.
pub fn transform_against_history(
    batch: &OperationBatch,
    history: &[OperationBatch],
) -> OperationBatch {
    let mut transformed = batch.clone();
    for historical in history {
        if historical.user_id == batch.user_id {
            continue;
        }
        let (_, next) = transform_batch(historical, &transformed, Priority::Left);
        transformed = next;
    }
    transformed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(content: &str, op: &Operation) -> String {
        let chars: Vec<char> = content.chars().collect();
        match op {
            Operation::Insert { position, text } => {
                let mut out: String = chars[..*position].iter().collect();
                out.push_str(text);
                out.extend(&chars[*position..]);
                out
            }
            Operation::Delete { position, count } => {
                let mut out: String = chars[..*position].iter().collect();
                out.extend(&chars[*position + *count..]);
                out
            }
            Operation::Retain { .. } => content.to_string(),
        }
    }

    fn both_paths(content: &str, a: &Operation, b: &Operation) -> (String, String) {
        let (a_prime, b_prime) = transform(a, b, Priority::Left);
        let mut path_a = apply(content, a);
        if let Some(bp) = &b_prime {
            path_a = apply(&path_a, bp);
        }
        let mut path_b = apply(content, b);
        if let Some(ap) = &a_prime {
            path_b = apply(&path_b, ap);
        }
        (path_a, path_b)
    }

    #[test]
    fn insert_insert_tie_left_priority() {
        let a = Operation::insert(5, " World");
        let b = Operation::insert(5, " There");
        let (a_prime, b_prime) = transform(&a, &b, Priority::Left);

        assert_eq!(a_prime, Some(Operation::insert(5, " World")));
        assert_eq!(b_prime, Some(Operation::insert(11, " There")));

        let (p1, p2) = both_paths("Hello", &a, &b);
        assert_eq!(p1, "Hello World There");
        assert_eq!(p1, p2);
    }

    #[test]
    fn insert_insert_tie_right_priority() {
        let a = Operation::insert(5, " World");
        let b = Operation::insert(5, " There");
        let (a_prime, b_prime) = transform(&a, &b, Priority::Right);
        assert_eq!(a_prime, Some(Operation::insert(11, " World")));
        assert_eq!(b_prime, Some(Operation::insert(5, " There")));
    }

    #[test]
    fn insert_before_delete_shifts_delete() {
        let a = Operation::insert(0, "XY");
        let b = Operation::delete(3, 2);
        let (_, b_prime) = transform(&a, &b, Priority::Left);
        assert_eq!(b_prime, Some(Operation::delete(5, 2)));

        let (p1, p2) = both_paths("abcdef", &a, &b);
        assert_eq!(p1, p2);
    }

    #[test]
    fn insert_inside_delete_is_absorbed() {
        // "Hello Beautiful World": insert at 10, delete "Beautiful " (6..16).
        let a = Operation::insert(10, "X");
        let b = Operation::delete(6, 10);
        let (a_prime, b_prime) = transform(&a, &b, Priority::Left);

        assert_eq!(a_prime, None);
        assert_eq!(b_prime, Some(Operation::delete(6, 11)));

        let (p1, p2) = both_paths("Hello Beautiful World", &a, &b);
        assert_eq!(p1, "Hello World");
        assert_eq!(p1, p2);
    }

    #[test]
    fn insert_at_delete_end_shifts_left() {
        let a = Operation::insert(5, "Z");
        let b = Operation::delete(2, 3);
        let (a_prime, _) = transform(&a, &b, Priority::Left);
        assert_eq!(a_prime, Some(Operation::insert(2, "Z")));

        let (p1, p2) = both_paths("abcdefg", &a, &b);
        assert_eq!(p1, p2);
    }

    #[test]
    fn delete_delete_disjoint() {
        let a = Operation::delete(0, 2);
        let b = Operation::delete(4, 2);
        let (a_prime, b_prime) = transform(&a, &b, Priority::Left);
        assert_eq!(a_prime, Some(Operation::delete(0, 2)));
        assert_eq!(b_prime, Some(Operation::delete(2, 2)));

        let (p1, p2) = both_paths("abcdef", &a, &b);
        assert_eq!(p1, p2);
    }

    #[test]
    fn delete_delete_partial_overlap() {
        // "ABCDEFGH": A deletes CDEF, B deletes EFGH; overlap EF credited once.
        let a = Operation::delete(2, 4);
        let b = Operation::delete(4, 4);
        let (a_prime, b_prime) = transform(&a, &b, Priority::Left);
        assert_eq!(a_prime, Some(Operation::delete(2, 2)));
        assert_eq!(b_prime, Some(Operation::delete(2, 2)));

        let (p1, p2) = both_paths("ABCDEFGH", &a, &b);
        assert_eq!(p1, "AB");
        assert_eq!(p1, p2);
    }

    #[test]
    fn delete_delete_identical_both_noop() {
        let a = Operation::delete(1, 3);
        let b = Operation::delete(1, 3);
        let (a_prime, b_prime) = transform(&a, &b, Priority::Left);
        assert_eq!(a_prime, None);
        assert_eq!(b_prime, None);
    }

    #[test]
    fn delete_covering_delete_absorbs_inner() {
        let a = Operation::delete(0, 6);
        let b = Operation::delete(2, 2);
        let (a_prime, b_prime) = transform(&a, &b, Priority::Left);
        assert_eq!(a_prime, Some(Operation::delete(0, 4)));
        assert_eq!(b_prime, None);

        let (p1, p2) = both_paths("abcdefgh", &a, &b);
        assert_eq!(p1, p2);
    }

    #[test]
    fn retain_is_identity() {
        let a = Operation::retain(4);
        let b = Operation::insert(1, "x");
        let (a_prime, b_prime) = transform(&a, &b, Priority::Left);
        assert_eq!(a_prime, Some(a));
        assert_eq!(b_prime, Some(b));
    }

    #[test]
    fn history_transform_skips_own_batches() {
        let own = OperationBatch::new("alice", "doc", 0, vec![Operation::insert(0, "aaa")]);
        let other = OperationBatch::new("bob", "doc", 0, vec![Operation::insert(0, "bb")]);
        let incoming = OperationBatch::new("alice", "doc", 0, vec![Operation::insert(0, "c")]);

        let transformed = transform_against_history(&incoming, &[own, other]);
        // Only bob's 2-char insert shifts the incoming op.
        assert_eq!(transformed.operations, vec![Operation::insert(2, "c")]);
    }

    proptest::proptest! {
        #[test]
        fn tp1_holds_for_concurrent_primitives(
            content in "[a-z]{1,20}",
            a_pos in 0usize..20,
            a_kind in 0u8..2,
            a_len in 1usize..5,
            b_pos in 0usize..20,
            b_kind in 0u8..2,
            b_len in 1usize..5,
        ) {
            let len = content.chars().count();
            let make = |kind: u8, pos: usize, n: usize| -> Operation {
                let pos = pos.min(len);
                if kind == 0 {
                    Operation::insert(pos, "x".repeat(n))
                } else {
                    let pos = pos.min(len.saturating_sub(1));
                    let count = n.min(len - pos).max(if len > pos { 1 } else { 0 });
                    if count == 0 {
                        Operation::retain(1)
                    } else {
                        Operation::delete(pos, count)
                    }
                }
            };
            let a = make(a_kind, a_pos, a_len);
            let b = make(b_kind, b_pos, b_len);

            let (p1, p2) = both_paths(&content, &a, &b);
            proptest::prop_assert_eq!(p1, p2);
        }
    }
}
