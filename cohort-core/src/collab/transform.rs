//! Position-only operational transform.
//!
//! An incoming operation is rebased over every logged operation its author
//! had not seen, in log order:
//!
//! ```text
//! prior insert  at p <  op.pos            → op.pos += len(prior)
//! prior insert  at p == op.pos, ranked ↑  → op.pos += len(prior)
//! prior delete  at p <  op.pos            → op.pos -= len(prior) (floor 0)
//! ```
//!
//! "Ranked ↑" means the prior operation has the greater
//! `(timestamp, authorId)` pair. Two inserts at the same position therefore
//! land in a fixed order (latest first) whichever arrives first, which is
//! what makes replicas converge. This is a single-axis transform with
//! client timestamps standing in for causality; it does not split deletes
//! around concurrent inserts.

use std::cmp::Ordering;

use super::CollabError;
use crate::protocol::{Operation, OperationKind};

/// Total order between operations: timestamp, then author.
pub fn rank(a: &Operation, b: &Operation) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.author_id.cmp(&b.author_id))
}

/// Whether `prior` is one `op` cannot have seen when no base version is
/// given: it ranks strictly later.
pub fn is_unseen_by(prior: &Operation, op: &Operation) -> bool {
    rank(prior, op) == Ordering::Greater
}

/// Rebase `op` over one prior operation.
pub fn transform_against(op: &mut Operation, prior: &Operation) {
    match prior.kind {
        OperationKind::Insert => {
            let shifts = prior.position < op.position
                || (prior.position == op.position && rank(prior, op) == Ordering::Greater);
            if shifts {
                op.position += prior.span();
            }
        }
        OperationKind::Delete => {
            if prior.position < op.position {
                op.position = op.position.saturating_sub(prior.span());
            }
        }
        OperationKind::Retain => {}
    }
}

/// Rebase `op` over `prior` (in log order).
pub fn transform<'a>(op: &Operation, prior: impl IntoIterator<Item = &'a Operation>) -> Operation {
    let mut rebased = op.clone();
    for p in prior {
        transform_against(&mut rebased, p);
    }
    rebased
}

/// Byte offset of character index `position`, if it is within `0..=len`.
fn byte_offset(content: &str, position: usize) -> Option<usize> {
    if position == 0 {
        return Some(0);
    }
    content
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(content.len()))
        .nth(position)
}

/// Check an operation against the content it will be applied to.
pub fn validate(content: &str, op: &Operation) -> Result<(), CollabError> {
    let length = content.chars().count();
    match op.kind {
        OperationKind::Insert => {
            if op.payload.as_deref().map_or(true, str::is_empty) {
                return Err(CollabError::InvalidOperation(
                    "insert without payload".to_string(),
                ));
            }
            if op.position > length {
                return Err(CollabError::OutOfBounds {
                    position: op.position,
                    length,
                });
            }
        }
        OperationKind::Delete => {
            let Some(count) = op.length else {
                return Err(CollabError::InvalidOperation(
                    "delete without length".to_string(),
                ));
            };
            if op.position.saturating_add(count) > length {
                return Err(CollabError::OutOfBounds {
                    position: op.position.saturating_add(count),
                    length,
                });
            }
        }
        OperationKind::Retain => {
            if op.position > length {
                return Err(CollabError::OutOfBounds {
                    position: op.position,
                    length,
                });
            }
        }
    }
    Ok(())
}

/// Apply a (transformed) operation to `content`.
pub fn apply(content: &str, op: &Operation) -> Result<String, CollabError> {
    validate(content, op)?;
    match op.kind {
        OperationKind::Insert => {
            let payload = op.payload.as_deref().unwrap_or_default();
            let at = byte_offset(content, op.position).unwrap_or(content.len());
            let mut out = String::with_capacity(content.len() + payload.len());
            out.push_str(&content[..at]);
            out.push_str(payload);
            out.push_str(&content[at..]);
            Ok(out)
        }
        OperationKind::Delete => {
            let count = op.length.unwrap_or(0);
            let start = byte_offset(content, op.position).unwrap_or(content.len());
            let end = byte_offset(content, op.position + count).unwrap_or(content.len());
            let mut out = String::with_capacity(content.len() - (end - start));
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            Ok(out)
        }
        OperationKind::Retain => Ok(content.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replay `ops` (all produced against an empty document at version 0)
    /// in the given arrival order, like the engine does with base versions.
    fn replay(ops: &[Operation], order: &[usize]) -> String {
        let mut content = String::new();
        let mut log: Vec<Operation> = Vec::new();
        for &i in order {
            let base = ops[i].base_version.unwrap_or(0) as usize;
            let rebased = transform(&ops[i], &log[base..]);
            content = apply(&content, &rebased).unwrap();
            log.push(rebased);
        }
        content
    }

    #[test]
    fn test_same_position_inserts_converge() {
        let x = Operation::insert(0, "X", "alice", 1).based_on(0);
        let y = Operation::insert(0, "Y", "bob", 2).based_on(0);
        let ops = [x, y];

        let forward = replay(&ops, &[0, 1]);
        let backward = replay(&ops, &[1, 0]);
        assert_eq!(forward, backward);
        assert_eq!(forward, "YX");
    }

    #[test]
    fn test_three_way_convergence_all_orders() {
        let ops = [
            Operation::insert(0, "X", "a", 1).based_on(0),
            Operation::insert(0, "Y", "b", 2).based_on(0),
            Operation::insert(0, "Z", "c", 3).based_on(0),
        ];
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            assert_eq!(replay(&ops, &order), "ZYX", "order {order:?}");
        }
    }

    #[test]
    fn test_equal_timestamps_ordered_by_author() {
        let ops = [
            Operation::insert(0, "a", "alice", 5).based_on(0),
            Operation::insert(0, "b", "bob", 5).based_on(0),
        ];
        assert_eq!(replay(&ops, &[0, 1]), replay(&ops, &[1, 0]));
    }

    #[test]
    fn test_unseen_by_timestamp() {
        let early = Operation::insert(0, "X", "alice", 1);
        let late = Operation::insert(0, "Y", "bob", 2);
        assert!(is_unseen_by(&late, &early));
        assert!(!is_unseen_by(&early, &late));
        assert!(!is_unseen_by(&early, &early));
    }

    #[test]
    fn test_insert_before_shifts_forward() {
        let prior = Operation::insert(2, "abc", "alice", 1);
        let mut op = Operation::insert(5, "!", "bob", 2);
        transform_against(&mut op, &prior);
        assert_eq!(op.position, 8);

        // After the op's position: no effect.
        let prior = Operation::insert(9, "abc", "alice", 1);
        transform_against(&mut op, &prior);
        assert_eq!(op.position, 8);
    }

    #[test]
    fn test_delete_before_shifts_back_with_floor() {
        let prior = Operation::delete(1, 2, "alice", 1);
        let mut op = Operation::insert(5, "!", "bob", 2);
        transform_against(&mut op, &prior);
        assert_eq!(op.position, 3);

        let prior = Operation::delete(0, 10, "alice", 1);
        let mut op = Operation::insert(4, "!", "bob", 2);
        transform_against(&mut op, &prior);
        assert_eq!(op.position, 0);

        // Delete at the same position: no shift.
        let prior = Operation::delete(4, 1, "alice", 1);
        let mut op = Operation::insert(4, "!", "bob", 2);
        transform_against(&mut op, &prior);
        assert_eq!(op.position, 4);
    }

    #[test]
    fn test_retain_never_shifts() {
        let prior = Operation::retain(0, "alice", 9);
        let mut op = Operation::insert(3, "!", "bob", 1);
        transform_against(&mut op, &prior);
        assert_eq!(op.position, 3);
    }

    #[test]
    fn test_apply_counts_characters() {
        let content = "héllo";
        let op = Operation::insert(2, "Ω", "alice", 1);
        assert_eq!(apply(content, &op).unwrap(), "héΩllo");

        let op = Operation::delete(1, 2, "alice", 2);
        assert_eq!(apply("héΩllo", &op).unwrap(), "hllo");

        let op = Operation::insert(5, "!", "alice", 3);
        assert_eq!(apply(content, &op).unwrap(), "héllo!");
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let err = apply("abc", &Operation::insert(4, "x", "alice", 1)).unwrap_err();
        assert!(matches!(err, CollabError::OutOfBounds { position: 4, length: 3 }));

        let err = apply("abc", &Operation::delete(2, 2, "alice", 1)).unwrap_err();
        assert!(matches!(err, CollabError::OutOfBounds { .. }));
    }

    #[test]
    fn test_malformed_operations_rejected() {
        let mut op = Operation::insert(0, "x", "alice", 1);
        op.payload = None;
        assert!(matches!(apply("", &op), Err(CollabError::InvalidOperation(_))));

        let mut op = Operation::delete(0, 1, "alice", 1);
        op.length = None;
        assert!(matches!(apply("abc", &op), Err(CollabError::InvalidOperation(_))));
    }

    #[test]
    fn test_retain_leaves_content() {
        assert_eq!(apply("abc", &Operation::retain(1, "alice", 1)).unwrap(), "abc");
    }
}
