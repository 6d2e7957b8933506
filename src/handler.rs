//! Task handler bindings and the job handle passed to callbacks.

use crate::model::{Element, ElementType};
use crate::variables::{VariableScope, Variables};
use crate::Key;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Which tasks a handler binds to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskMatcher {
    /// Element id; applies to service and user tasks.
    Id(String),
    /// `taskDefinition` type; service tasks only.
    Type(String),
    /// User-task assignee.
    Assignee(String),
    /// Any overlap with a user task's candidate groups.
    CandidateGroups(Vec<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MatchKind {
    Id,
    Type,
    Assignee,
    CandidateGroups,
}

impl TaskMatcher {
    fn kind(&self) -> MatchKind {
        match self {
            TaskMatcher::Id(_) => MatchKind::Id,
            TaskMatcher::Type(_) => MatchKind::Type,
            TaskMatcher::Assignee(_) => MatchKind::Assignee,
            TaskMatcher::CandidateGroups(_) => MatchKind::CandidateGroups,
        }
    }

    pub fn matches(&self, element: &Element) -> bool {
        match self {
            TaskMatcher::Id(id) => element.id == *id,
            TaskMatcher::Type(t) => element.task_type.as_deref() == Some(t.as_str()),
            TaskMatcher::Assignee(a) => element.assignee.as_deref() == Some(a.as_str()),
            TaskMatcher::CandidateGroups(groups) => groups
                .iter()
                .any(|g| element.candidate_groups.iter().any(|c| c == g)),
        }
    }
}

/// Callback invoked synchronously when a job is activated.
pub type TaskHandler = Box<dyn FnMut(&mut ActivatedJob<'_>) + Send>;

/// Handlers in registration order.
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: Vec<(TaskMatcher, TaskHandler)>,
}

impl TaskHandlerRegistry {
    pub fn register(&mut self, matcher: TaskMatcher, handler: TaskHandler) {
        self.handlers.push((matcher, handler));
    }

    /// Index of the handler that fires for `element`, if any.
    ///
    /// Match kinds are tried by priority: id first, then type for service
    /// tasks, or assignee and candidate groups for user tasks.
    pub fn resolve(&self, element: &Element) -> Option<usize> {
        let order: &[MatchKind] = match element.kind {
            ElementType::ServiceTask => &[MatchKind::Id, MatchKind::Type],
            ElementType::UserTask => &[
                MatchKind::Id,
                MatchKind::Assignee,
                MatchKind::CandidateGroups,
            ],
            _ => &[MatchKind::Id],
        };
        order.iter().find_map(|kind| {
            self.handlers
                .iter()
                .position(|(m, _)| m.kind() == *kind && m.matches(element))
        })
    }

    pub fn find_mut(&mut self, element: &Element) -> Option<&mut TaskHandler> {
        let idx = self.resolve(element)?;
        self.handlers.get_mut(idx).map(|(_, handler)| handler)
    }
}

impl std::fmt::Debug for TaskHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|(m, _)| m))
            .finish()
    }
}

// ─── Job handle ───────────────────────────────────────────────

/// Terminal result reported by a handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
}

/// Identity of the job being handled.
#[derive(Clone, Debug)]
pub struct JobContext {
    pub key: Key,
    pub instance_key: Key,
    pub process_key: Key,
    pub bpmn_process_id: String,
    pub process_version: i32,
    pub element_id: String,
    pub element_name: String,
    pub task_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Handle given to a task handler for one activation.
///
/// Variables live in a child scope seeded with the instance variables and the
/// task's input mappings. Only the first of [`complete`](Self::complete) or
/// [`fail`](Self::fail) takes effect.
pub struct ActivatedJob<'p> {
    context: JobContext,
    scope: VariableScope<'p>,
    outcome: Option<JobOutcome>,
}

impl<'p> ActivatedJob<'p> {
    pub(crate) fn new(context: JobContext, scope: VariableScope<'p>) -> Self {
        Self {
            context,
            scope,
            outcome: None,
        }
    }

    pub fn key(&self) -> Key {
        self.context.key
    }

    pub fn instance_key(&self) -> Key {
        self.context.instance_key
    }

    pub fn process_key(&self) -> Key {
        self.context.process_key
    }

    pub fn bpmn_process_id(&self) -> &str {
        &self.context.bpmn_process_id
    }

    pub fn process_version(&self) -> i32 {
        self.context.process_version
    }

    pub fn element_id(&self) -> &str {
        &self.context.element_id
    }

    pub fn element_name(&self) -> &str {
        &self.context.element_name
    }

    pub fn task_type(&self) -> Option<&str> {
        self.context.task_type.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.context.created_at
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.scope.get(name)
    }

    pub fn variables(&self) -> &Variables {
        self.scope.variables()
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.scope.set(name, value.into());
    }

    pub fn complete(&mut self) {
        if self.outcome.is_none() {
            self.outcome = Some(JobOutcome::Completed);
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.outcome.is_none() {
            self.outcome = Some(JobOutcome::Failed(reason.into()));
        }
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    pub(crate) fn into_parts(self) -> (VariableScope<'p>, Option<JobOutcome>) {
        (self.scope, self.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: &str, task_type: &str) -> Element {
        let mut e = Element::new(id, id, ElementType::ServiceTask);
        e.task_type = Some(task_type.into());
        e
    }

    fn user(id: &str, assignee: Option<&str>, groups: &[&str]) -> Element {
        let mut e = Element::new(id, id, ElementType::UserTask);
        e.assignee = assignee.map(str::to_string);
        e.candidate_groups = groups.iter().map(|g| g.to_string()).collect();
        e
    }

    fn noop() -> TaskHandler {
        Box::new(|_job: &mut ActivatedJob<'_>| {})
    }

    #[test]
    fn test_id_beats_type_regardless_of_registration_order() {
        let mut registry = TaskHandlerRegistry::default();
        registry.register(TaskMatcher::Type("email".into()), noop());
        registry.register(TaskMatcher::Id("notify".into()), noop());
        assert_eq!(registry.resolve(&service("notify", "email")), Some(1));
        assert_eq!(registry.resolve(&service("other", "email")), Some(0));
    }

    #[test]
    fn test_first_registered_wins_within_kind() {
        let mut registry = TaskHandlerRegistry::default();
        registry.register(TaskMatcher::Type("email".into()), noop());
        registry.register(TaskMatcher::Type("email".into()), noop());
        assert_eq!(registry.resolve(&service("a", "email")), Some(0));
    }

    #[test]
    fn test_type_matcher_ignores_user_tasks() {
        let mut registry = TaskHandlerRegistry::default();
        registry.register(TaskMatcher::Type("review".into()), noop());
        let mut task = user("review", None, &[]);
        task.task_type = Some("review".into());
        assert_eq!(registry.resolve(&task), None);
    }

    #[test]
    fn test_user_task_assignee_then_candidate_groups() {
        let mut registry = TaskHandlerRegistry::default();
        registry.register(
            TaskMatcher::CandidateGroups(vec!["ops".into(), "finance".into()]),
            noop(),
        );
        registry.register(TaskMatcher::Assignee("sam".into()), noop());
        assert_eq!(registry.resolve(&user("t", Some("sam"), &["finance"])), Some(1));
        assert_eq!(registry.resolve(&user("t", Some("kim"), &["finance"])), Some(0));
        assert_eq!(registry.resolve(&user("t", None, &["legal"])), None);
    }

    #[test]
    fn test_first_terminal_call_wins() {
        let mut vars = Variables::new();
        let context = JobContext {
            key: 1,
            instance_key: 2,
            process_key: 3,
            bpmn_process_id: "p".into(),
            process_version: 1,
            element_id: "t".into(),
            element_name: "Task".into(),
            task_type: None,
            created_at: Utc::now(),
        };
        let mut job = ActivatedJob::new(context, VariableScope::child_of(&mut vars));
        job.set_variable("x", 5);
        job.fail("boom");
        job.complete();
        assert_eq!(job.outcome(), Some(&JobOutcome::Failed("boom".into())));
        assert_eq!(job.variable("x"), Some(&Value::from(5)));
        let (scope, _) = job.into_parts();
        assert!(scope.has_parent());
    }
}
