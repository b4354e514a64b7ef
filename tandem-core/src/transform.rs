//! Operational transform.
//!
//! `transform(a, b) -> (a′, b′)` satisfies the convergence property:
//!
//! ```text
//! apply(apply(D, a), b′) == apply(apply(D, b), a′)
//! ```
//!
//! Ties between inserts at the same position are broken by
//! `(client_id, op id)` so every replica picks the same order: the lower
//! id's text ends up first.

use crate::operation::{OpKind, Operation};
use crate::text::char_len;

/// Transform two concurrent operations against each other.
///
/// Returns `(a′, b′)` where `a′` applies after `b` and `b′` applies after `a`.
pub fn transform(a: &Operation, b: &Operation) -> (Operation, Operation) {
    let a_wins_ties = wins_tie(a, b);
    let (a_components, b_components) =
        transform_components(&a.components, &b.components, a_wins_ties);
    (a.with_components(a_components), b.with_components(b_components))
}

/// Transform `op` in sequence against every operation in `history`, oldest first.
pub fn transform_against_history<'a, I>(op: &Operation, history: I) -> Operation
where
    I: IntoIterator<Item = &'a Operation>,
{
    history
        .into_iter()
        .fold(op.clone(), |acc, applied| transform(&acc, applied).0)
}

fn wins_tie(a: &Operation, b: &Operation) -> bool {
    (a.client_id.as_str(), a.id) < (b.client_id.as_str(), b.id)
}

/// Transform two component sequences. No-op components are dropped.
pub fn transform_components(
    a: &[OpKind],
    b: &[OpKind],
    a_wins_ties: bool) -> (Vec<OpKind>, Vec<OpKind>,
) {
    let a: Vec<OpKind> = a.iter().filter(|c| !c.is_noop()).cloned().collect();
    let b: Vec<OpKind> = b.iter().filter(|c| !c.is_noop()).cloned().collect();
    transform_seq(&a, &b, a_wins_ties)
}

fn transform_seq(a: &[OpKind], b: &[OpKind], a_wins: bool) -> (Vec<OpKind>, Vec<OpKind>) {
    if a.is_empty() || b.is_empty() {
        return (a.to_vec(), b.to_vec());
    }

    if a.len() > 1 {
        let (head, b1) = transform_seq(&a[..1], b, a_wins);
        let (mut tail, b2) = transform_seq(&a[1..], &b1, a_wins);
        let mut out = head;
        out.append(&mut tail);
        return (out, b2);
    }

    if b.len() > 1 {
        let (a1, head) = transform_seq(a, &b[..1], a_wins);
        let (a2, mut tail) = transform_seq(&a1, &b[1..], a_wins);
        let mut out = head;
        out.append(&mut tail);
        return (a2, out);
    }

    transform_pair(&a[0], &b[0], a_wins)
}

fn transform_pair(a: &OpKind, b: &OpKind, a_wins: bool) -> (Vec<OpKind>, Vec<OpKind>) {
    match (a, b) {
        (OpKind::Insert { position: p, text: s }, OpKind::Insert { position: q, text: t }) => {
            if p < q || (p == q && a_wins) {
                (vec![a.clone()], vec![OpKind::insert(q + char_len(s), t.clone())])
            } else {
                (vec![OpKind::insert(p + char_len(t), s.clone())], vec![b.clone()])
            }
        }

        (OpKind::Insert { position: p, text: s }, OpKind::Delete { position: q, length: l }) => {
            let (p, q, l) = (*p, *q, *l);
            let inserted = char_len(s);
            if p <= q {
                (vec![a.clone()], vec![OpKind::delete(q + inserted, l)])
            } else if p >= q + l {
                (vec![OpKind::insert(p - l, s.clone())], vec![b.clone()])
            } else {
                // Insert lands inside the deleted range: the text survives
                // and the delete splits around it.
                (
                    vec![OpKind::insert(q, s.clone())],
                    vec![
                        OpKind::delete(q, p - q),
                        OpKind::delete(q + inserted, q + l - p),
                    ],
                )
            }
        }

        (OpKind::Delete { .. }, OpKind::Insert { .. }) => {
            let (b_prime, a_prime) = transform_pair(b, a, !a_wins);
            (a_prime, b_prime)
        }

        (
            OpKind::Delete { position: p, length: l1 },
            OpKind::Delete { position: q, length: l2 },
        ) => {
            let (p, l1, q, l2) = (*p, *l1, *q, *l2);
            let overlap = (p + l1).min(q + l2).saturating_sub(p.max(q));
            let a_prime = OpKind::delete(shift_past_delete(p, q, l2), l1 - overlap);
            let b_prime = OpKind::delete(shift_past_delete(q, p, l1), l2 - overlap);
            (non_empty(a_prime), non_empty(b_prime))
        }
    }
}

/// Where `position` lands after `[start, start + length)` is removed.
fn shift_past_delete(position: usize, start: usize, length: usize) -> usize {
    position - position.min(start + length).saturating_sub(start)
}

fn non_empty(kind: OpKind) -> Vec<OpKind> {
    if kind.is_noop() {
        Vec::new()
    } else {
        vec![kind]
    }
}

/// Transform a cursor position against one component.
///
/// `sticky` marks a cursor owned by the client that made the edit: an
/// insert exactly at the cursor then pushes it to the end of the new text.
pub fn transform_position(position: usize, component: &OpKind, sticky: bool) -> usize {
    match component {
        OpKind::Insert { position: p, text } => {
            if *p < position || (*p == position && sticky) {
                position + char_len(text)
            } else {
                position
            }
        }
        OpKind::Delete { position: p, length } => {
            if *p >= position {
                position
            } else if p + length <= position {
                position - length
            } else {
                *p
            }
        }
    }
}

/// Transform a cursor position against every component of `op`.
pub fn transform_position_by(position: usize, op: &Operation, sticky: bool) -> usize {
    op.components
        .iter()
        .fold(position, |pos, component| transform_position(pos, component, sticky))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn converge(doc: &str, a: &Operation, b: &Operation) -> (String, String) {
        let (a_prime, b_prime) = transform(a, b);
        let left = b_prime.apply_to_str(&a.apply_to_str(doc).unwrap()).unwrap();
        let right = a_prime.apply_to_str(&b.apply_to_str(doc).unwrap()).unwrap();
        (left, right)
    }

    #[test]
    fn test_insert_insert_different_positions() {
        let a = Operation::insert("a", 0, 1, "X");
        let b = Operation::insert("b", 0, 3, "Y");
        let (left, right) = converge("hello", &a, &b);
        assert_eq!(left, "hXelYlo");
        assert_eq!(left, right);
    }

    #[test]
    fn test_insert_insert_tie_lower_client_first() {
        let a = Operation::insert("bob", 0, 2, "B");
        let b = Operation::insert("alice", 0, 2, "A");
        let (left, right) = converge("hello", &a, &b);
        assert_eq!(left, "heABllo");
        assert_eq!(left, right);
    }

    #[test]
    fn test_insert_before_delete_shifts_delete() {
        let a = Operation::insert("a", 0, 0, "X");
        let b = Operation::delete("b", 0, 4, 1);
        let (left, right) = converge("hello", &a, &b);
        assert_eq!(left, "Xhell");
        assert_eq!(left, right);
    }

    #[test]
    fn test_insert_after_delete_unaffected_delete() {
        let a = Operation::insert("a", 0, 5, "!");
        let b = Operation::delete("b", 0, 0, 2);
        let (a_prime, b_prime) = transform(&a, &b);
        assert_eq!(a_prime.components, vec![OpKind::insert(3, "!")]);
        assert_eq!(b_prime.components, b.components);
    }

    #[test]
    fn test_insert_inside_delete_splits_delete() {
        let a = Operation::insert("a", 0, 3, "X");
        let b = Operation::delete("b", 0, 1, 4);
        let (a_prime, b_prime) = transform(&a, &b);
        assert_eq!(a_prime.components, vec![OpKind::insert(1, "X")]);
        assert_eq!(
            b_prime.components,
            vec![OpKind::delete(1, 2), OpKind::delete(2, 2)]
        );
        let (left, right) = converge("abcdef", &a, &b);
        assert_eq!(left, "aXf");
        assert_eq!(left, right);
    }

    #[test]
    fn test_delete_delete_overlap_removed_once() {
        let a = Operation::delete("a", 0, 1, 3);
        let b = Operation::delete("b", 0, 2, 3);
        let (left, right) = converge("abcdef", &a, &b);
        assert_eq!(left, "af");
        assert_eq!(left, right);
    }

    #[test]
    fn test_delete_contained_becomes_noop() {
        let a = Operation::delete("a", 0, 2, 1);
        let b = Operation::delete("b", 0, 1, 4);
        let (a_prime, _) = transform(&a, &b);
        assert!(a_prime.components.is_empty());
        assert!(a_prime.is_noop());
        let (left, right) = converge("abcdef", &a, &b);
        assert_eq!(left, "af");
        assert_eq!(left, right);
    }

    #[test]
    fn test_identical_deletes() {
        let a = Operation::delete("a", 0, 1, 2);
        let b = Operation::delete("b", 0, 1, 2);
        let (left, right) = converge("abcd", &a, &b);
        assert_eq!(left, "ad");
        assert_eq!(left, right);
    }

    #[test]
    fn test_transform_against_history_sequential() {
        // Server history: "hello" -> "Xhello" -> "Xhelo"
        let h1 = Operation::insert("a", 0, 0, "X");
        let h2 = Operation::delete("b", 1, 4, 1);
        // Client at version 0 appends "!" at the end of "hello".
        let late = Operation::insert("c", 0, 5, "!");
        let rebased = transform_against_history(&late, [&h1, &h2]);
        let doc = h2.apply_to_str(&h1.apply_to_str("hello").unwrap()).unwrap();
        assert_eq!(rebased.apply_to_str(&doc).unwrap(), "Xhelo!");
        assert_eq!(rebased.id, late.id);
    }

    #[test]
    fn test_transform_position_rules() {
        assert_eq!(transform_position(5, &OpKind::insert(2, "abc"), false), 8);
        assert_eq!(transform_position(5, &OpKind::insert(5, "abc"), false), 5);
        assert_eq!(transform_position(5, &OpKind::insert(5, "abc"), true), 8);
        assert_eq!(transform_position(5, &OpKind::insert(7, "abc"), false), 5);
        assert_eq!(transform_position(5, &OpKind::delete(1, 2), false), 3);
        assert_eq!(transform_position(5, &OpKind::delete(3, 4), false), 3);
        assert_eq!(transform_position(5, &OpKind::delete(5, 4), false), 5);
    }

    fn arb_component(len: usize) -> BoxedStrategy<OpKind> {
        let insert = (0..=len, "[a-z]{1,3}").prop_map(|(p, t)| OpKind::insert(p, t));
        if len == 0 {
            return insert.boxed();
        }
        let delete = (0..len)
            .prop_flat_map(move |p| (Just(p), 1..=(len - p)))
            .prop_map(|(p, l)| OpKind::delete(p, l));
        prop_oneof![insert, delete].boxed()
    }

    fn arb_case() -> impl Strategy<Value = (String, OpKind, OpKind)> {
        "[a-z]{0,12}".prop_flat_map(|doc| {
            let len = doc.len();
            (Just(doc), arb_component(len), arb_component(len))
        })
    }

    proptest! {
        #[test]
        fn prop_pairwise_convergence(
            (doc, a_kind, b_kind) in arb_case(),
            a_lower in any::<bool>(),
        ) {
            let (client_a, client_b) = if a_lower { ("alice", "bob") } else { ("bob", "alice") };
            let a = Operation::new(client_a, 0, a_kind);
            let b = Operation::new(client_b, 0, b_kind);
            let (left, right) = converge(&doc, &a, &b);
            prop_assert_eq!(left, right);
        }

        #[test]
        fn prop_split_operations_converge(
            doc in "[a-z]{4,12}",
            ins_pos in 0usize..13,
            del_pos in 0usize..12,
            other in 0usize..16,
        ) {
            let len = doc.len();
            let ins_pos = ins_pos % (len + 1);
            let del_pos = del_pos % len;
            let del_len = (len - del_pos).min(3);
            let splitter = Operation::insert("n", 0, ins_pos, "XY");
            let source = Operation::delete("m", 0, del_pos, del_len);
            // `split` may carry two components; it applies after `splitter`.
            let (_, split) = transform(&splitter, &source);
            let after_insert = splitter.apply_to_str(&doc).unwrap();
            let third = Operation::insert("o", 1, other % (after_insert.len() + 1), "Q");
            let (left, right) = converge(&after_insert, &split, &third);
            prop_assert_eq!(left, right);
        }
    }
}
