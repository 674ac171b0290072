use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::warn;

/// Reserved service name marking a recipient as a group indirection.
pub const GROUP_SERVICE: &str = "group";

/// Deepest level of group nesting that is still expanded. A group seen at a
/// deeper level aborts the dispatch, which also bounds membership cycles.
pub const MAX_GROUP_DEPTH: usize = 20;

/// Addressable target of an action: a concrete user on a messaging service,
/// or a named group that the directory expands into further recipients.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    Individual { service_name: String, user_id: String },
    Group { group_id: String },
}

#[derive(Debug, Error)]
#[error("invalid recipient string {raw:?} (expected service:user_id)")]
pub struct RecipientParseError {
    raw: String,
}

impl Recipient {
    pub fn individual(service_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::Individual {
            service_name: service_name.into(),
            user_id: user_id.into(),
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self::Group {
            group_id: group_id.into(),
        }
    }

    /// Parse the canonical wire form `service:user_id`. The service name
    /// `group` is reserved and yields a group recipient.
    pub fn parse(raw: &str) -> Result<Self, RecipientParseError> {
        let err = || RecipientParseError {
            raw: raw.to_string(),
        };
        let (service, id) = raw.split_once(':').ok_or_else(err)?;
        if service.is_empty() || id.is_empty() {
            return Err(err());
        }
        if service == GROUP_SERVICE {
            Ok(Self::group(id))
        } else {
            Ok(Self::individual(service, id))
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Individual {
                service_name,
                user_id,
            } => write!(f, "{service_name}:{user_id}"),
            Self::Group { group_id } => write!(f, "{GROUP_SERVICE}:{group_id}"),
        }
    }
}

/// An action name plus its attributes, decoded upstream and immutable here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    name: String,
    attrs: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
#[error("invalid action string {raw:?}")]
pub struct ActionParseError {
    raw: String,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attrs(name: impl Into<String>, attrs: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            attrs,
        }
    }

    /// Parse the wire form `NAME` or `NAME?key=value&key=value`. Empty attr
    /// segments are ignored; a segment without `=` becomes a flag with an
    /// empty value.
    pub fn parse(raw: &str) -> Result<Self, ActionParseError> {
        let (name, query) = match raw.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (raw, None),
        };
        if name.is_empty() {
            return Err(ActionParseError {
                raw: raw.to_string(),
            });
        }
        let mut attrs = BTreeMap::new();
        if let Some(query) = query {
            for segment in query.split('&').filter(|s| !s.is_empty()) {
                match segment.split_once('=') {
                    Some((key, value)) if !key.is_empty() => {
                        attrs.insert(key.to_string(), value.to_string());
                    }
                    Some(_) => {}
                    None => {
                        attrs.insert(segment.to_string(), String::new());
                    }
                }
            }
        }
        Ok(Self {
            name: name.to_string(),
            attrs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn attrs(&self) -> &BTreeMap<String, String> {
        &self.attrs
    }
}

/// Everything a handler needs to deliver one action to one individual.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub service_name: String,
    pub user_id: String,
    pub action: Action,
}

impl DeliveryContext {
    pub fn new(recipient: &Recipient, action: &Action) -> Self {
        let (service_name, user_id) = match recipient {
            Recipient::Individual {
                service_name,
                user_id,
            } => (service_name.clone(), user_id.clone()),
            Recipient::Group { group_id } => (GROUP_SERVICE.to_string(), group_id.clone()),
        };
        Self {
            service_name,
            user_id,
            action: action.clone(),
        }
    }
}

/// Per-service capability that turns a (recipient, action) pair into an
/// executable context and produces a result string.
pub trait ActionHandler: Send + Sync {
    fn create_context(&self, recipient: &Recipient, action: &Action) -> DeliveryContext;
    fn execute(&self, context: DeliveryContext) -> anyhow::Result<String>;
}

/// Handler lookup by service name, assembled at startup.
pub trait HandlerRegistry: Send + Sync {
    fn lookup(&self, service_name: &str) -> Option<Arc<dyn ActionHandler>>;
}

/// Ordered group membership lookup. `None` means the group id is unknown.
pub trait GroupDirectory: Send + Sync {
    fn members(&self, group_id: &str) -> Option<Vec<Recipient>>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("group nesting exceeded {MAX_GROUP_DEPTH} levels (membership cycle?)")]
    RecursionTooDeep,
    #[error("unknown group: {0}")]
    GroupNotFound(String),
    #[error("no handler registered for service: {0}")]
    UnsupportedService(String),
    #[error("handler failed: {0}")]
    Handler(#[source] anyhow::Error),
    #[error("dispatch was cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag checked at every recursion boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Resolves a recipient to concrete individuals (expanding groups in order,
/// depth-first) and invokes the per-service handler for each, collecting the
/// results in visitation order. The first error aborts the whole dispatch.
pub struct ActionDispatcher {
    directory: Arc<dyn GroupDirectory>,
    handlers: Arc<dyn HandlerRegistry>,
}

impl ActionDispatcher {
    pub fn new(directory: Arc<dyn GroupDirectory>, handlers: Arc<dyn HandlerRegistry>) -> Self {
        Self {
            directory,
            handlers,
        }
    }

    pub fn dispatch(
        &self,
        recipient: &Recipient,
        action: &Action,
    ) -> Result<Vec<String>, DispatchError> {
        self.dispatch_with_cancel(recipient, action, &CancelToken::new())
    }

    pub fn dispatch_with_cancel(
        &self,
        recipient: &Recipient,
        action: &Action,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, DispatchError> {
        let mut results = Vec::new();
        self.visit(recipient, action, 0, cancel, &mut results)?;
        Ok(results)
    }

    fn visit(
        &self,
        recipient: &Recipient,
        action: &Action,
        level: usize,
        cancel: &CancelToken,
        results: &mut Vec<String>,
    ) -> Result<(), DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        match recipient {
            Recipient::Group { group_id } => {
                if level > MAX_GROUP_DEPTH {
                    warn!(%group_id, action = action.name(), "group expansion too deep");
                    return Err(DispatchError::RecursionTooDeep);
                }
                let members = self
                    .directory
                    .members(group_id)
                    .ok_or_else(|| DispatchError::GroupNotFound(group_id.clone()))?;
                for member in &members {
                    self.visit(member, action, level + 1, cancel, results)?;
                }
            }
            Recipient::Individual { service_name, .. } => {
                let handler = self
                    .handlers
                    .lookup(service_name)
                    .ok_or_else(|| DispatchError::UnsupportedService(service_name.clone()))?;
                let context = handler.create_context(recipient, action);
                let outcome = handler.execute(context).map_err(DispatchError::Handler)?;
                results.push(outcome);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MapDirectory {
        groups: HashMap<String, Vec<Recipient>>,
    }

    impl MapDirectory {
        fn new(groups: &[(&str, Vec<Recipient>)]) -> Arc<Self> {
            Arc::new(Self {
                groups: groups
                    .iter()
                    .map(|(id, members)| (id.to_string(), members.clone()))
                    .collect(),
            })
        }
    }

    impl GroupDirectory for MapDirectory {
        fn members(&self, group_id: &str) -> Option<Vec<Recipient>> {
            self.groups.get(group_id).cloned()
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        contexts_created: Mutex<usize>,
        executed: Mutex<Vec<String>>,
        fail_for: Option<String>,
        cancel_after_first: Option<CancelToken>,
    }

    impl ActionHandler for RecordingHandler {
        fn create_context(&self, recipient: &Recipient, action: &Action) -> DeliveryContext {
            *self.contexts_created.lock() += 1;
            DeliveryContext::new(recipient, action)
        }

        fn execute(&self, context: DeliveryContext) -> anyhow::Result<String> {
            if self.fail_for.as_deref() == Some(context.user_id.as_str()) {
                return Err(anyhow!("delivery to {} failed", context.user_id));
            }
            let mut executed = self.executed.lock();
            executed.push(context.user_id.clone());
            if executed.len() == 1
                && let Some(token) = &self.cancel_after_first
            {
                token.cancel();
            }
            Ok(format!("{}:{}", context.action.name(), context.user_id))
        }
    }

    struct SingleServiceRegistry {
        service: String,
        handler: Arc<RecordingHandler>,
    }

    impl SingleServiceRegistry {
        fn new(service: &str, handler: Arc<RecordingHandler>) -> Arc<Self> {
            Arc::new(Self {
                service: service.to_string(),
                handler,
            })
        }
    }

    impl HandlerRegistry for SingleServiceRegistry {
        fn lookup(&self, service_name: &str) -> Option<Arc<dyn ActionHandler>> {
            (service_name == self.service).then(|| self.handler.clone() as Arc<dyn ActionHandler>)
        }
    }

    fn dispatcher_with(
        groups: &[(&str, Vec<Recipient>)],
        handler: Arc<RecordingHandler>,
    ) -> ActionDispatcher {
        ActionDispatcher::new(
            MapDirectory::new(groups),
            SingleServiceRegistry::new("slack", handler),
        )
    }

    /// Chain of `depth` nested groups ending in one individual.
    fn nested_groups(depth: usize) -> Vec<(String, Vec<Recipient>)> {
        let mut groups = Vec::new();
        for i in 0..depth {
            let member = if i + 1 == depth {
                Recipient::individual("slack", "leaf")
            } else {
                Recipient::group(format!("g{}", i + 1))
            };
            groups.push((format!("g{i}"), vec![member]));
        }
        groups
    }

    #[test]
    fn individual_dispatch_invokes_handler_once() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher_with(&[], handler.clone());

        let results = dispatcher
            .dispatch(&Recipient::individual("slack", "u1"), &Action::new("ping"))
            .unwrap();

        assert_eq!(results, vec!["ping:u1".to_string()]);
        assert_eq!(*handler.executed.lock(), vec!["u1".to_string()]);
    }

    #[test]
    fn group_dispatch_visits_members_in_pre_order() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher_with(
            &[
                (
                    "team-a",
                    vec![
                        Recipient::individual("slack", "u1"),
                        Recipient::group("team-b"),
                    ],
                ),
                ("team-b", vec![Recipient::individual("slack", "u2")]),
            ],
            handler.clone(),
        );

        let results = dispatcher
            .dispatch(&Recipient::group("team-a"), &Action::new("hello"))
            .unwrap();

        assert_eq!(results, vec!["hello:u1".to_string(), "hello:u2".to_string()]);
        assert_eq!(*handler.executed.lock(), vec!["u1", "u2"]);
    }

    #[test]
    fn expanded_group_yields_one_result_per_individual() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher_with(
            &[
                (
                    "all",
                    vec![
                        Recipient::group("left"),
                        Recipient::individual("slack", "mid"),
                        Recipient::group("right"),
                    ],
                ),
                (
                    "left",
                    vec![
                        Recipient::individual("slack", "a"),
                        Recipient::individual("slack", "b"),
                    ],
                ),
                ("right", vec![Recipient::individual("slack", "c")]),
            ],
            handler,
        );

        let results = dispatcher
            .dispatch(&Recipient::group("all"), &Action::new("fanout"))
            .unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(
            results,
            vec!["fanout:a", "fanout:b", "fanout:mid", "fanout:c"]
        );
    }

    #[test]
    fn nesting_at_the_depth_bound_succeeds() {
        let groups = nested_groups(21);
        let refs: Vec<(&str, Vec<Recipient>)> = groups
            .iter()
            .map(|(id, members)| (id.as_str(), members.clone()))
            .collect();
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher_with(&refs, handler);

        let results = dispatcher
            .dispatch(&Recipient::group("g0"), &Action::new("deep"))
            .unwrap();
        assert_eq!(results, vec!["deep:leaf".to_string()]);
    }

    #[test]
    fn nesting_past_the_depth_bound_fails() {
        let groups = nested_groups(22);
        let refs: Vec<(&str, Vec<Recipient>)> = groups
            .iter()
            .map(|(id, members)| (id.as_str(), members.clone()))
            .collect();
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher_with(&refs, handler.clone());

        let err = dispatcher
            .dispatch(&Recipient::group("g0"), &Action::new("deep"))
            .unwrap_err();
        assert!(matches!(err, DispatchError::RecursionTooDeep));
        assert!(handler.executed.lock().is_empty());
    }

    #[test]
    fn cyclic_membership_terminates_with_recursion_error() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher_with(
            &[
                ("a", vec![Recipient::group("b")]),
                ("b", vec![Recipient::group("a")]),
            ],
            handler,
        );

        let err = dispatcher
            .dispatch(&Recipient::group("a"), &Action::new("loop"))
            .unwrap_err();
        assert!(matches!(err, DispatchError::RecursionTooDeep));
    }

    #[test]
    fn handler_failure_aborts_before_later_siblings() {
        let handler = Arc::new(RecordingHandler {
            fail_for: Some("u2".to_string()),
            ..RecordingHandler::default()
        });
        let dispatcher = dispatcher_with(
            &[(
                "team",
                vec![
                    Recipient::individual("slack", "u1"),
                    Recipient::individual("slack", "u2"),
                    Recipient::individual("slack", "u3"),
                ],
            )],
            handler.clone(),
        );

        let err = dispatcher
            .dispatch(&Recipient::group("team"), &Action::new("notify"))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Handler(_)));
        assert_eq!(*handler.executed.lock(), vec!["u1"]);
    }

    #[test]
    fn unknown_service_creates_no_context() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher_with(&[], handler.clone());

        let err = dispatcher
            .dispatch(&Recipient::individual("pager", "u1"), &Action::new("ping"))
            .unwrap_err();
        match err {
            DispatchError::UnsupportedService(service) => assert_eq!(service, "pager"),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(*handler.contexts_created.lock(), 0);
    }

    #[test]
    fn unknown_group_invokes_no_handlers() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = dispatcher_with(&[], handler.clone());

        let err = dispatcher
            .dispatch(&Recipient::group("ghosts"), &Action::new("ping"))
            .unwrap_err();
        match err {
            DispatchError::GroupNotFound(group) => assert_eq!(group, "ghosts"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(handler.executed.lock().is_empty());
    }

    #[test]
    fn cancellation_stops_remaining_siblings() {
        let token = CancelToken::new();
        let handler = Arc::new(RecordingHandler {
            cancel_after_first: Some(token.clone()),
            ..RecordingHandler::default()
        });
        let dispatcher = dispatcher_with(
            &[(
                "team",
                vec![
                    Recipient::individual("slack", "u1"),
                    Recipient::individual("slack", "u2"),
                ],
            )],
            handler.clone(),
        );

        let err = dispatcher
            .dispatch_with_cancel(&Recipient::group("team"), &Action::new("stop"), &token)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
        assert_eq!(*handler.executed.lock(), vec!["u1"]);
    }

    #[test]
    fn recipient_wire_form_round_trips() {
        let user = Recipient::parse("slack:U123").unwrap();
        assert_eq!(user, Recipient::individual("slack", "U123"));
        assert_eq!(user.to_string(), "slack:U123");

        let group = Recipient::parse("group:team-a").unwrap();
        assert_eq!(group, Recipient::group("team-a"));
        assert_eq!(group.to_string(), "group:team-a");

        assert!(Recipient::parse("no-separator").is_err());
        assert!(Recipient::parse(":missing-service").is_err());
        assert!(Recipient::parse("slack:").is_err());
    }

    #[test]
    fn action_wire_form_parses_attrs() {
        let plain = Action::parse("greet").unwrap();
        assert_eq!(plain.name(), "greet");
        assert!(plain.attrs().is_empty());

        let with_attrs = Action::parse("weather?city=tokyo&units=c").unwrap();
        assert_eq!(with_attrs.name(), "weather");
        assert_eq!(with_attrs.attr("city"), Some("tokyo"));
        assert_eq!(with_attrs.attr("units"), Some("c"));

        let flag = Action::parse("ping?verbose").unwrap();
        assert_eq!(flag.attr("verbose"), Some(""));

        assert!(Action::parse("").is_err());
        assert!(Action::parse("?city=tokyo").is_err());
    }
}
