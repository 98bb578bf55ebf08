use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use flumirror_api::{RemoteNode, RemoteOp, Upstream};

use super::{BatchItem, CommandMessage, CommandResult, ComponentCommand};
use crate::error::{CoreError, RouteError};
use crate::projection::Projector;
use crate::store::ComponentSet;

/// A validated command resolved against the mirror: the remote
/// operations to issue, one per target component.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub(crate) command: ComponentCommand,
    pub(crate) calls: Vec<(String, RemoteNode, RemoteOp)>,
}

/// Validates inbound commands and runs them against the upstream.
pub struct CommandRouter;

impl CommandRouter {
    /// Decode and validate a command message body.
    pub fn parse(body: &str) -> Result<ComponentCommand, RouteError> {
        ComponentCommand::try_from(CommandMessage::from_json(body)?)
    }

    /// Resolve the command's targets in the current mirror. Fails without
    /// side effects if a named component is not mirrored.
    pub(crate) fn resolve(command: ComponentCommand, components: &ComponentSet) -> Result<Dispatch, RouteError> {
        let lookup = |name: &str| {
            components
                .get(name)
                .map(|entry| entry.node.clone())
                .ok_or_else(|| RouteError::ComponentNotFound(name.to_owned()))
        };

        let calls = match &command {
            ComponentCommand::CallRemote {
                component,
                method,
                params,
            } => vec![(component.clone(), lookup(component)?, RemoteOp::Call {
                method: method.clone(),
                params: params.clone(),
            })],
            ComponentCommand::Start { component } => {
                vec![(component.clone(), lookup(component)?, RemoteOp::Start)]
            }
            ComponentCommand::Stop { component } => {
                vec![(component.clone(), lookup(component)?, RemoteOp::Stop)]
            }
            ComponentCommand::InvokeOnComponents {
                selector,
                method,
                params,
            } => {
                if let Some(names) = &selector.names {
                    for name in names {
                        lookup(name)?;
                    }
                }
                let op = RemoteOp::Call {
                    method: method.clone(),
                    params: params.clone(),
                };
                let calls: Vec<_> = components
                    .iter()
                    .filter(|entry| selector.matches(&entry.record))
                    .map(|entry| (entry.record.name.clone(), entry.node.clone(), op.clone()))
                    .collect();
                if calls.is_empty() {
                    return Err(RouteError::NoMatch);
                }
                calls
            }
        };

        Ok(Dispatch { command, calls })
    }

    /// Issue the remote operations. Runs outside the event loop.
    pub(crate) async fn run(
        upstream: Arc<dyn Upstream>,
        projector: Projector,
        dispatch: Dispatch,
    ) -> Result<CommandResult, CoreError> {
        let Dispatch { command, calls } = dispatch;
        debug!(command = %command.kind(), target = %command.target(), calls = calls.len(), "dispatching");

        if let ComponentCommand::InvokeOnComponents { .. } = command {
            let results = join_all(calls.into_iter().map(|(name, node, op)| {
                let upstream = Arc::clone(&upstream);
                let projector = projector.clone();
                async move {
                    let result = upstream
                        .invoke(&node, op)
                        .await
                        .map(|value| projector.result_value(&value))
                        .map_err(|e| {
                            warn!(component = %name, error = %e, "batch invocation failed");
                            e.to_string()
                        });
                    BatchItem {
                        component: name,
                        result,
                    }
                }
            }))
            .await;
            return Ok(CommandResult::Batch(results));
        }

        let Some((name, node, op)) = calls.into_iter().next() else {
            return Err(CoreError::Internal("command resolved to no calls".into()));
        };
        match upstream.invoke(&node, op).await {
            Ok(value) => Ok(CommandResult::Value(projector.result_value(&value))),
            Err(e) => {
                warn!(component = %name, command = %command.kind(), error = %e, "command failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::command::Selector;
    use crate::model::Mood;
    use crate::store::MirroredComponent;
    use flumirror_api::{ListenerId, MemoryUpstream};
    use serde_json::json;

    fn mirror(upstream: &MemoryUpstream, moods: &[(&str, i64)]) -> ComponentSet {
        let flow = upstream.add_flow("default");
        let mut set = ComponentSet::new();
        for (seq, (name, mood)) in (1..).zip(moods) {
            let node = upstream.add_component(&flow, name, *mood);
            set.insert(MirroredComponent {
                record: Arc::new(Projector::default().component(&node)),
                listener: upstream.watch(&node, ListenerId { epoch: 1, seq }),
                node,
            });
        }
        set
    }

    #[test]
    fn unknown_target_is_not_found() {
        let upstream = MemoryUpstream::new();
        let set = mirror(&upstream, &[("enc1", 0)]);

        let err = CommandRouter::resolve(ComponentCommand::Start { component: "enc2".into() }, &set).unwrap_err();
        assert_eq!(err, RouteError::ComponentNotFound("enc2".into()));
    }

    #[test]
    fn selector_resolves_matching_components() {
        let upstream = MemoryUpstream::new();
        let set = mirror(&upstream, &[("a", 0), ("b", 5), ("c", 5)]);

        let command = ComponentCommand::InvokeOnComponents {
            selector: Selector {
                names: None,
                mood: Some(Mood::Sad),
            },
            method: "reload".into(),
            params: Vec::new(),
        };
        let dispatch = CommandRouter::resolve(command, &set).unwrap();
        let names: Vec<&str> = dispatch.calls.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(names, ["b", "c"]);

        let none = ComponentCommand::InvokeOnComponents {
            selector: Selector {
                names: None,
                mood: Some(Mood::Lost),
            },
            method: "reload".into(),
            params: Vec::new(),
        };
        assert_eq!(CommandRouter::resolve(none, &set).unwrap_err(), RouteError::NoMatch);
    }

    #[tokio::test]
    async fn run_reports_remote_failures() {
        let upstream = MemoryUpstream::new();
        let set = mirror(&upstream, &[("a", 0), ("b", 0)]);
        upstream.fail_invocations("reload", "not supported");

        let dispatch = CommandRouter::resolve(
            CommandRouter::parse(r#"{"command":"invokeOnComponents","component":["a","b"],"method":"reload"}"#).unwrap(),
            &set,
        )
        .unwrap();
        let result = CommandRouter::run(Arc::new(upstream.clone()), Projector::default(), dispatch)
            .await
            .unwrap();

        let CommandResult::Batch(items) = result else {
            panic!("expected a batch result");
        };
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item.result.is_err()));
        assert_eq!(upstream.calls().len(), 2);

        let dispatch = CommandRouter::resolve(
            CommandRouter::parse(r#"{"command":"componentStart","component":"a"}"#).unwrap(),
            &set,
        )
        .unwrap();
        let result = CommandRouter::run(Arc::new(upstream.clone()), Projector::default(), dispatch).await;
        assert_eq!(result.unwrap(), CommandResult::Value(json!(null)));
    }
}
