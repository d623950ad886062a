use crate::protocol::Action;

/// Where a resumed thread should stop next.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Hash)]
pub enum StepPolicy {
    /// Run until a breakpoint.
    #[default]
    Run,
    /// Stop at the very next line, entering calls.
    Into,
    /// Stop at the next line at the same or a shallower depth.
    Over { depth: usize },
    /// Stop at the next line strictly shallower than `depth`.
    Out { depth: usize },
}

impl StepPolicy {
    /// Policy for a resume-class action issued at stack `depth`.
    ///
    /// `Break` and `Stop` are not resume actions for a paused thread and map to `Run`.
    pub fn from_action(action: Action, depth: usize) -> Self {
        match action {
            Action::StepInto => StepPolicy::Into,
            Action::StepOver => StepPolicy::Over { depth },
            Action::StepOut => StepPolicy::Out { depth },
            Action::Continue | Action::Break | Action::Stop => StepPolicy::Run,
        }
    }

    #[inline(always)]
    pub fn is_stepping(&self) -> bool {
        !matches!(self, StepPolicy::Run)
    }

    /// Whether a line event at stack `depth` satisfies the policy.
    pub fn should_stop(&self, depth: usize) -> bool {
        match *self {
            StepPolicy::Run => false,
            StepPolicy::Into => true,
            StepPolicy::Over { depth: step_depth } => depth <= step_depth,
            StepPolicy::Out { depth: step_depth } => depth < step_depth,
        }
    }
}
