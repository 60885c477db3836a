//! `ProvisionerActor`: background bootstrap registry
//!
//! Owns the provisioning tasks started from `Update`. A task's only write is
//! its terminal outcome, sent back to the actor and kept until the next
//! `Update` of the node takes it. Each start bumps a generation number so a
//! cancelled or superseded task cannot record an outcome.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use kameo_macros::Reply;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CoreError;

/// Identity of a node across clusters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub cluster: String,
    pub node: String,
}

impl NodeKey {
    #[must_use]
    pub fn new(cluster: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            node: node.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.node)
    }
}

/// Terminal result of a provisioning task
#[derive(Debug, Clone, PartialEq, Eq, Reply)]
pub enum ProvisionOutcome {
    Succeeded,
    Failed {
        /// Failing bootstrap step, if the failure happened inside one
        step: Option<String>,
        error: String,
    },
}

impl ProvisionOutcome {
    /// Outcome of a finished task body
    #[must_use]
    pub fn from_result(result: Result<(), CoreError>) -> Self {
        match result {
            Ok(()) => ProvisionOutcome::Succeeded,
            Err(e) => ProvisionOutcome::Failed {
                step: e.step().map(str::to_string),
                error: e.to_string(),
            },
        }
    }
}

/// Body of a provisioning task
pub type ProvisionTask = Pin<Box<dyn Future<Output = ProvisionOutcome> + Send>>;

struct InFlight {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Single writer of provisioning outcomes
pub struct ProvisionerActor {
    next_generation: u64,
    in_flight: HashMap<NodeKey, InFlight>,
    outcomes: HashMap<NodeKey, ProvisionOutcome>,
    self_ref: WeakActorRef<Self>,
}

impl Actor for ProvisionerActor {
    type Args = ();
    type Error = CoreError;

    async fn on_start(_args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(id = %actor_ref.id(), "ProvisionerActor starting");
        Ok(Self {
            next_generation: 0,
            in_flight: HashMap::new(),
            outcomes: HashMap::new(),
            self_ref: actor_ref.downgrade(),
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, in_flight = self.in_flight.len(), "ProvisionerActor stopping");
        for (key, task) in self.in_flight.drain() {
            debug!(node = %key, "aborting provisioning task");
            task.handle.abort();
        }
        Ok(())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Start a task for a node unless one is already running
pub struct Start {
    pub key: NodeKey,
    pub task: ProvisionTask,
}

impl fmt::Debug for Start {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Start")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Sent by a task when it finishes
#[derive(Debug)]
pub struct Finished {
    pub key: NodeKey,
    pub generation: u64,
    pub outcome: ProvisionOutcome,
}

/// Remove and return the recorded outcome of a node
#[derive(Debug)]
pub struct TakeOutcome {
    pub key: NodeKey,
}

/// Whether a task is running for a node
#[derive(Debug)]
pub struct IsInFlight {
    pub key: NodeKey,
}

/// Abort a node's task and drop its recorded outcome
#[derive(Debug)]
pub struct Cancel {
    pub key: NodeKey,
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<Start> for ProvisionerActor {
    /// `false` if a task was already running for the node
    type Reply = bool;

    async fn handle(&mut self, msg: Start, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.in_flight.contains_key(&msg.key) {
            debug!(node = %msg.key, "provisioning already in flight");
            return false;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        self.outcomes.remove(&msg.key);

        let key = msg.key.clone();
        let task = msg.task;
        let weak = self.self_ref.clone();
        let handle = tokio::spawn(async move {
            let outcome = task.await;
            let Some(actor_ref) = weak.upgrade() else {
                return;
            };
            let finished = Finished {
                key,
                generation,
                outcome,
            };
            if let Err(e) = actor_ref.tell(finished).await {
                warn!(error = ?e, "failed to record provisioning outcome");
            }
        });

        info!(node = %msg.key, generation, "provisioning started");
        self.in_flight
            .insert(msg.key, InFlight { generation, handle });
        true
    }
}

impl Message<Finished> for ProvisionerActor {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: Finished,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        match self.in_flight.get(&msg.key) {
            Some(current) if current.generation == msg.generation => {
                self.in_flight.remove(&msg.key);
                info!(node = %msg.key, outcome = ?msg.outcome, "provisioning finished");
                self.outcomes.insert(msg.key, msg.outcome);
            }
            _ => debug!(
                node = %msg.key,
                generation = msg.generation,
                "discarding outcome of superseded task"
            ),
        }
    }
}

impl Message<TakeOutcome> for ProvisionerActor {
    type Reply = Option<ProvisionOutcome>;

    async fn handle(
        &mut self,
        msg: TakeOutcome,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.outcomes.remove(&msg.key)
    }
}

impl Message<IsInFlight> for ProvisionerActor {
    type Reply = bool;

    async fn handle(
        &mut self,
        msg: IsInFlight,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.in_flight.contains_key(&msg.key)
    }
}

impl Message<Cancel> for ProvisionerActor {
    /// `true` if a running task was aborted
    type Reply = bool;

    async fn handle(&mut self, msg: Cancel, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.outcomes.remove(&msg.key);
        match self.in_flight.remove(&msg.key) {
            Some(task) => {
                task.handle.abort();
                info!(node = %msg.key, generation = task.generation, "provisioning cancelled");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kameo::actor::Spawn;
    use tokio::sync::oneshot;

    use super::*;

    fn key() -> NodeKey {
        NodeKey::new("demo", "node-1")
    }

    async fn wait_for_outcome(actor: &ActorRef<ProvisionerActor>) -> ProvisionOutcome {
        for _ in 0..100 {
            if let Some(outcome) = actor.ask(TakeOutcome { key: key() }).await.unwrap() {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no outcome recorded");
    }

    #[tokio::test]
    async fn test_outcome_is_taken_once() {
        let actor = ProvisionerActor::spawn(());

        let started = actor
            .ask(Start {
                key: key(),
                task: Box::pin(async { ProvisionOutcome::Succeeded }),
            })
            .await
            .unwrap();
        assert!(started);

        assert_eq!(wait_for_outcome(&actor).await, ProvisionOutcome::Succeeded);
        assert_eq!(actor.ask(TakeOutcome { key: key() }).await.unwrap(), None);
        assert!(!actor.ask(IsInFlight { key: key() }).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_start_is_refused_while_in_flight() {
        let actor = ProvisionerActor::spawn(());
        let (release, gate) = oneshot::channel::<()>();

        let first = actor
            .ask(Start {
                key: key(),
                task: Box::pin(async move {
                    gate.await.ok();
                    ProvisionOutcome::Succeeded
                }),
            })
            .await
            .unwrap();
        let second = actor
            .ask(Start {
                key: key(),
                task: Box::pin(async { ProvisionOutcome::Succeeded }),
            })
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert!(actor.ask(IsInFlight { key: key() }).await.unwrap());

        release.send(()).unwrap();
        assert_eq!(wait_for_outcome(&actor).await, ProvisionOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_cancelled_task_records_nothing() {
        let actor = ProvisionerActor::spawn(());
        let (_release, gate) = oneshot::channel::<()>();

        actor
            .ask(Start {
                key: key(),
                task: Box::pin(async move {
                    gate.await.ok();
                    ProvisionOutcome::Succeeded
                }),
            })
            .await
            .unwrap();

        assert!(actor.ask(Cancel { key: key() }).await.unwrap());
        assert!(!actor.ask(IsInFlight { key: key() }).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(actor.ask(TakeOutcome { key: key() }).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_generation_is_discarded() {
        let actor = ProvisionerActor::spawn(());
        let (_release, gate) = oneshot::channel::<()>();

        actor
            .ask(Start {
                key: key(),
                task: Box::pin(async move {
                    gate.await.ok();
                    ProvisionOutcome::Succeeded
                }),
            })
            .await
            .unwrap();

        actor
            .ask(Finished {
                key: key(),
                generation: 0,
                outcome: ProvisionOutcome::Succeeded,
            })
            .await
            .unwrap();

        assert!(actor.ask(IsInFlight { key: key() }).await.unwrap());
        assert_eq!(actor.ask(TakeOutcome { key: key() }).await.unwrap(), None);
    }

    #[test]
    fn test_outcome_from_step_failure() {
        let outcome = ProvisionOutcome::from_result(Err(CoreError::StepFailed {
            step: "Docker Engine installation".into(),
            stderr: "E: Unable to locate package".into(),
        }));
        assert!(matches!(
            outcome,
            ProvisionOutcome::Failed { step: Some(ref s), .. } if s == "Docker Engine installation"
        ));
    }
}
