//! In-progress resolution stack used for dependency cycle detection.

use std::collections::HashSet;

/// Names currently being resolved, outermost first.
#[derive(Debug, Default)]
pub struct ResolutionStack {
    names: Vec<String>,
    members: HashSet<String>,
}

impl ResolutionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains(name)
    }

    pub fn push(&mut self, name: &str) {
        self.names.push(name.to_string());
        self.members.insert(name.to_string());
    }

    pub fn pop(&mut self) {
        if let Some(name) = self.names.pop() {
            self.members.remove(&name);
        }
    }

    pub fn depth(&self) -> usize {
        self.names.len()
    }

    /// The chain closing a cycle on `name`: from its first occurrence on the
    /// stack to the top, then `name` again.
    pub fn cycle_through(&self, name: &str) -> Vec<String> {
        let start = self
            .names
            .iter()
            .position(|entry| entry == name)
            .unwrap_or(0);
        let mut chain = self.names[start..].to_vec();
        chain.push(name.to_string());
        chain
    }
}

/// Render a cycle chain as `a -> b -> a`.
pub fn format_cycle(chain: &[String]) -> String {
    chain.join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_chain_starts_at_reentered_name() {
        let mut stack = ResolutionStack::new();
        stack.push("tool");
        stack.push("a");
        stack.push("b");
        assert!(stack.contains("a"));
        assert_eq!(format_cycle(&stack.cycle_through("a")), "a -> b -> a");
        assert_eq!(stack.depth(), 3);
    }

    #[test]
    fn pop_forgets_membership() {
        let mut stack = ResolutionStack::new();
        stack.push("a");
        stack.pop();
        assert!(!stack.contains("a"));
        stack.pop();
        assert_eq!(stack.depth(), 0);
    }
}
