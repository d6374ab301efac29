//! Status and progress roll-up over a task tree.
//!
//! A node with children takes the precedence-max of its children's computed
//! statuses (`failed > cancelled > in_progress > pending > completed`) and
//! the arithmetic mean of their computed progresses. Leaves report whatever
//! the executor wrote.

use apflow_db::models::{TaskStatus, TaskTreeNode};

/// Round a progress value to 2-decimal precision.
pub fn round_progress(progress: f64) -> f64 {
    (progress * 100.0).round() / 100.0
}

/// Computed status of a node: leaves report their own status, internal
/// nodes the precedence-max of their children's computed statuses.
pub fn rolled_up_status(node: &TaskTreeNode) -> TaskStatus {
    if node.children.is_empty() {
        return node.task.status;
    }
    node.children
        .iter()
        .map(rolled_up_status)
        .max_by_key(|s| s.precedence())
        .expect("non-empty children")
}

/// Computed progress of a node: leaves report their own progress, internal
/// nodes the mean of their children's computed progresses.
pub fn rolled_up_progress(node: &TaskTreeNode) -> f64 {
    if node.children.is_empty() {
        return node.task.progress;
    }
    let sum: f64 = node.children.iter().map(rolled_up_progress).sum();
    round_progress(sum / node.children.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apflow_db::models::{JsonMap, Task};
    use chrono::Utc;

    fn task(id: &str, status: TaskStatus, progress: f64) -> Task {
        Task {
            id: id.to_owned(),
            parent_id: None,
            user_id: None,
            name: id.to_owned(),
            status,
            priority: 1,
            dependencies: vec![],
            inputs: JsonMap::new(),
            params: JsonMap::new(),
            schemas: JsonMap::new(),
            result: None,
            error: None,
            progress,
            has_children: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
            extra: JsonMap::new(),
        }
    }

    fn node(id: &str, status: TaskStatus, progress: f64) -> TaskTreeNode {
        TaskTreeNode::new(task(id, status, progress))
    }

    #[test]
    fn leaf_reports_itself() {
        let leaf = node("a", TaskStatus::InProgress, 0.4);
        assert_eq!(rolled_up_status(&leaf), TaskStatus::InProgress);
        assert_eq!(rolled_up_progress(&leaf), 0.4);
    }

    #[test]
    fn parent_takes_precedence_max() {
        let mut root = node("r", TaskStatus::Pending, 0.0);
        root.add_child(node("a", TaskStatus::Completed, 1.0));
        root.add_child(node("b", TaskStatus::Failed, 1.0));
        assert_eq!(rolled_up_status(&root), TaskStatus::Failed);

        let mut root = node("r", TaskStatus::Pending, 0.0);
        root.add_child(node("a", TaskStatus::Completed, 1.0));
        root.add_child(node("b", TaskStatus::Cancelled, 1.0));
        assert_eq!(rolled_up_status(&root), TaskStatus::Cancelled);

        let mut root = node("r", TaskStatus::Pending, 0.0);
        root.add_child(node("a", TaskStatus::Completed, 1.0));
        root.add_child(node("b", TaskStatus::Pending, 0.0));
        assert_eq!(rolled_up_status(&root), TaskStatus::Pending);
    }

    #[test]
    fn all_completed_rolls_up_completed() {
        let mut root = node("r", TaskStatus::Pending, 0.0);
        root.add_child(node("a", TaskStatus::Completed, 1.0));
        root.add_child(node("b", TaskStatus::Completed, 1.0));
        assert_eq!(rolled_up_status(&root), TaskStatus::Completed);
        assert_eq!(rolled_up_progress(&root), 1.0);
    }

    #[test]
    fn progress_is_mean_of_children() {
        let mut root = node("r", TaskStatus::Pending, 0.0);
        root.add_child(node("a", TaskStatus::Completed, 1.0));
        root.add_child(node("b", TaskStatus::InProgress, 0.5));
        root.add_child(node("c", TaskStatus::Pending, 0.0));
        assert_eq!(rolled_up_progress(&root), 0.5);
    }

    #[test]
    fn progress_rounds_to_two_decimals() {
        let mut root = node("r", TaskStatus::Pending, 0.0);
        root.add_child(node("a", TaskStatus::Completed, 1.0));
        root.add_child(node("b", TaskStatus::Pending, 0.0));
        root.add_child(node("c", TaskStatus::Pending, 0.0));
        assert_eq!(rolled_up_progress(&root), 0.33);
    }

    #[test]
    fn nested_rollup_recurses() {
        let mut mid = node("m", TaskStatus::Pending, 0.0);
        mid.add_child(node("a", TaskStatus::Completed, 1.0));
        mid.add_child(node("b", TaskStatus::InProgress, 0.0));

        let mut root = node("r", TaskStatus::Pending, 0.0);
        root.add_child(mid);
        root.add_child(node("c", TaskStatus::Completed, 1.0));

        assert_eq!(rolled_up_status(&root), TaskStatus::InProgress);
        assert_eq!(rolled_up_progress(&root), 0.75);
    }
}
