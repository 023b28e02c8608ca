use std::collections::VecDeque;

use crate::llm::ToolCallRequest;

/// Remembers the last few tool-call signatures and flags repeats.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    window: usize,
    threshold: usize,
    recent: VecDeque<String>,
}

impl LoopDetector {
    pub fn new(window: usize, threshold: usize) -> Self {
        Self {
            window: window.max(1),
            threshold: threshold.max(2),
            recent: VecDeque::new(),
        }
    }

    /// Record `call`; returns how often its signature now appears in the
    /// window when that reaches the threshold.
    pub fn observe(&mut self, call: &ToolCallRequest) -> Option<usize> {
        let sig = call.signature();
        self.recent.push_back(sig.clone());
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }
        let count = self.recent.iter().filter(|s| **s == sig).count();
        (count >= self.threshold).then_some(count)
    }

    pub fn clear(&mut self) {
        self.recent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "browser_snapshot", r#"{"interactive":true}"#)
    }

    #[test]
    fn third_repeat_is_flagged() {
        let mut d = LoopDetector::new(10, 3);
        assert_eq!(d.observe(&snap("1")), None);
        assert_eq!(d.observe(&snap("2")), None);
        assert_eq!(d.observe(&snap("3")), Some(3));
        assert_eq!(d.observe(&snap("4")), Some(4));
    }

    #[test]
    fn old_calls_fall_out_of_the_window() {
        let mut d = LoopDetector::new(3, 3);
        d.observe(&snap("1"));
        d.observe(&snap("2"));
        d.observe(&ToolCallRequest::new("3", "browser_click", r#"{"ref":"e1"}"#));
        d.observe(&ToolCallRequest::new("4", "browser_click", r#"{"ref":"e2"}"#));
        assert_eq!(d.observe(&snap("5")), None);
    }

    #[test]
    fn different_arguments_are_different_actions() {
        let mut d = LoopDetector::new(10, 2);
        d.observe(&ToolCallRequest::new("1", "browser_click", r#"{"ref":"e1"}"#));
        assert_eq!(
            d.observe(&ToolCallRequest::new("2", "browser_click", r#"{"ref":"e2"}"#)),
            None
        );
        d.clear();
        assert_eq!(
            d.observe(&ToolCallRequest::new("3", "browser_click", r#"{"ref":"e2"}"#)),
            None
        );
    }
}
