//! Signal routing: decides which targets of a connection receive a signal.

pub mod mapping;
pub mod rql;

use std::sync::Arc;

use twinbridge_core::errors::ConnectivityError;
use twinbridge_core::model::{Connection, Target, Topic};
use twinbridge_core::predicate::{Predicate, PredicateCompiler};
use twinbridge_core::signal::Signal;
use twinbridge_telemetry::MetricsRecorder;

use crate::pool::client::OutboundMessage;

/// Why a target did not receive a signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Not subscribed to the signal's topic, or the topic is never delivered.
    Topic,
    /// No overlap between read subjects and the target's authorization context.
    Unauthorized,
    Namespace,
    Filter,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Unauthorized => "unauthorized",
            Self::Namespace => "namespace",
            Self::Filter => "filter",
        }
    }
}

#[derive(Debug)]
struct CompiledSubscription {
    topic: Topic,
    namespaces: Vec<String>,
    filter: Option<Arc<dyn Predicate>>,
}

#[derive(Debug)]
struct CompiledTarget {
    target: Target,
    subscriptions: Vec<CompiledSubscription>,
}

/// Targets of one connection revision with their filters compiled.
#[derive(Debug)]
pub struct RoutingTable {
    targets: Vec<CompiledTarget>,
}

impl RoutingTable {
    /// Compile every subscription filter; the first bad filter fails the table.
    pub fn compile(connection: &Connection, compiler: &dyn PredicateCompiler) -> Result<Self, ConnectivityError> {
        let mut targets = Vec::with_capacity(connection.targets().len());
        for target in connection.targets() {
            let mut subscriptions = Vec::with_capacity(target.subscriptions().len());
            for subscription in target.subscriptions() {
                let filter = match subscription.filter() {
                    Some(expression) => Some(compiler.compile(expression).map_err(|e| {
                        ConnectivityError::ConfigurationInvalid(format!(
                            "target '{}': invalid filter '{expression}': {e}",
                            target.address()
                        ))
                    })?),
                    None => None,
                };
                subscriptions.push(CompiledSubscription {
                    topic: subscription.topic(),
                    namespaces: subscription.namespaces().to_vec(),
                    filter,
                });
            }
            targets.push(CompiledTarget {
                target: target.clone(),
                subscriptions,
            });
        }
        Ok(Self { targets })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Targets receiving `signal`, in declaration order, each at most once.
    pub fn route(&self, signal: &Signal) -> Vec<&Target> {
        self.route_observed(signal, |_, _| {})
    }

    /// Like [`route`](Self::route), reporting every target decision to `observe`.
    pub fn route_observed<F>(&self, signal: &Signal, mut observe: F) -> Vec<&Target>
    where
        F: FnMut(&Target, Result<(), DropReason>),
    {
        let payload_context = signal.evaluation_context();
        let mut routed = Vec::new();
        for compiled in &self.targets {
            let decision = decide(compiled, signal, |filter| filter.evaluate(&payload_context));
            observe(&compiled.target, decision);
            if decision.is_ok() {
                routed.push(&compiled.target);
            }
        }
        routed
    }
}

fn decide<E>(compiled: &CompiledTarget, signal: &Signal, mut evaluate: E) -> Result<(), DropReason>
where
    E: FnMut(&Arc<dyn Predicate>) -> bool,
{
    let topic = signal.topic();
    if !topic.is_deliverable() {
        return Err(DropReason::Topic);
    }
    let authorized = compiled
        .target
        .authorization_context()
        .iter()
        .any(|subject| signal.read_subjects().contains(subject));
    if !authorized {
        return Err(DropReason::Unauthorized);
    }

    let mut reason = DropReason::Topic;
    for subscription in compiled.subscriptions.iter().filter(|s| s.topic == topic) {
        let namespace_ok = subscription.namespaces.is_empty()
            || subscription.namespaces.iter().any(|ns| ns == signal.namespace());
        if !namespace_ok {
            if reason == DropReason::Topic {
                reason = DropReason::Namespace;
            }
            continue;
        }
        match &subscription.filter {
            Some(filter) if !evaluate(filter) => reason = DropReason::Filter,
            _ => return Ok(()),
        }
    }
    Err(reason)
}

/// Routes signals through a [`RoutingTable`] and counts the outcome.
#[derive(Clone, Default)]
pub struct SignalRouter {
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<MetricsRecorder>) -> Self {
        Self { metrics: Some(metrics) }
    }

    pub fn route<'t>(&self, table: &'t RoutingTable, signal: &Signal, connection_id: &str) -> Vec<&'t Target> {
        table.route_observed(signal, |_, decision| {
            let Some(metrics) = &self.metrics else {
                return;
            };
            match decision {
                Ok(()) => metrics.counter_inc("router.accepted", &[("connection", connection_id)], 1),
                Err(reason) => metrics.counter_inc(
                    "router.dropped",
                    &[("connection", connection_id), ("reason", reason.as_str())],
                    1,
                ),
            }
        })
    }

    /// Route and render one outbound message per receiving target.
    pub fn messages(&self, table: &RoutingTable, signal: &Signal, connection_id: &str) -> Vec<OutboundMessage> {
        self.route(table, signal, connection_id)
            .into_iter()
            .map(|target| OutboundMessage::for_target(target, signal))
            .collect()
    }
}

/// One-off routing without a prepared table.
pub fn route<'c>(
    connection: &'c Connection,
    signal: &Signal,
    compiler: &dyn PredicateCompiler,
) -> Result<Vec<&'c Target>, ConnectivityError> {
    let table = RoutingTable::compile(connection, compiler)?;
    let context = signal.evaluation_context();
    Ok(table
        .targets
        .iter()
        .zip(connection.targets())
        .filter(|(compiled, _)| decide(compiled, signal, |f| f.evaluate(&context)).is_ok())
        .map(|(_, target)| target)
        .collect())
}
