//! End-to-end scenarios: deployment, resolution, and execution together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use phaseflow_core::{
    ChainEntry, ConfigError, ExchangeState, ExecutionError, Flow, FnHandler, Handler, HandlerDescription,
    HandlerFault, InvocationResponse, MessageContext, NodeId, Parameter, PhaseOrder, Value,
};
use phaseflow_server::{
    ConfigurationContext, DeploymentError, Engine, EngineConfig, ExchangeStatus, Module, Scope,
};
use tokio::sync::Barrier;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Behavior {
    Continue,
    Pause,
    Fault,
}

/// Counts its invocations and appends its name to the context's `trace`.
struct Recorder {
    name: &'static str,
    behavior: Behavior,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Handler for Recorder {
    async fn invoke(&self, ctx: &mut MessageContext) -> Result<InvocationResponse, HandlerFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let mut trace = ctx
            .property("trace")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        if !trace.is_empty() {
            trace.push(',');
        }
        trace.push_str(self.name);
        ctx.set_property("trace", trace);

        match self.behavior {
            Behavior::Continue => Ok(InvocationResponse::Continue),
            Behavior::Pause => Ok(InvocationResponse::Pause),
            Behavior::Fault => Err(HandlerFault::rejected(format!("{} refused", self.name))),
        }
    }
}

/// Builds recorder entries and remembers their call counters by name.
#[derive(Default)]
struct Calls(Mutex<HashMap<&'static str, Arc<AtomicU32>>>);

impl Calls {
    fn entry(&self, description: HandlerDescription, behavior: Behavior) -> Arc<ChainEntry> {
        let name: &'static str = Box::leak(description.name.clone().into_boxed_str());
        let calls = Arc::clone(self.0.lock().entry(name).or_default());
        Arc::new(ChainEntry::new(
            description,
            Arc::new(Recorder {
                name,
                behavior,
                calls,
            }),
        ))
    }

    fn count(&self, name: &str) -> u32 {
        self.0
            .lock()
            .get(name)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }
}

/// Module contributing inbound handlers and counting `init` calls.
struct CountingModule {
    name: &'static str,
    handlers: Vec<Arc<ChainEntry>>,
    inits: Arc<AtomicU32>,
}

#[async_trait]
impl Module for CountingModule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn handlers(&self, flow: Flow) -> Vec<Arc<ChainEntry>> {
        if flow == Flow::In {
            self.handlers.clone()
        } else {
            Vec::new()
        }
    }

    async fn init(&self, _configuration: &ConfigurationContext) -> anyhow::Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn configuration(phases: &[&str]) -> ConfigurationContext {
    let config = EngineConfig {
        phase_order: PhaseOrder::uniform(phases),
        ..EngineConfig::default()
    };
    let configuration = ConfigurationContext::new(config);
    for service in ["Service1", "Service2"] {
        configuration.add_service(service).unwrap();
        configuration.add_operation(service, "echo").unwrap();
    }
    configuration
}

fn trace_of(ctx: &MessageContext) -> &str {
    ctx.property("trace").and_then(Value::as_str).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[test]
fn global_lock_blocks_service_override() {
    let configuration = configuration(&["Dispatch"]);
    let service = configuration.node_id(&Scope::service("Service1")).unwrap();
    let operation = configuration
        .node_id(&Scope::operation("Service1", "echo"))
        .unwrap();

    configuration
        .add_parameter(NodeId::GLOBAL, Parameter::locked("FEAT", "on"))
        .unwrap();

    let err = configuration
        .add_parameter(service, Parameter::new("FEAT", "off"))
        .unwrap_err();
    assert_eq!(
        err,
        ConfigError::LockedParameter {
            name: "FEAT".to_string(),
            node: "global/service:Service1".to_string(),
            locked_by: "global".to_string(),
        }
    );
    assert!(configuration.is_locked(operation, "FEAT"));
    assert_eq!(
        configuration.parameter(operation, "FEAT").map(|p| p.value),
        Some(Value::from("on"))
    );
}

#[test]
fn service_lock_does_not_leak_to_siblings() {
    let configuration = configuration(&["Dispatch"]);
    let one = configuration.node_id(&Scope::service("Service1")).unwrap();
    let two = configuration.node_id(&Scope::service("Service2")).unwrap();

    configuration
        .add_parameter(one, Parameter::locked("retries", 3_i64))
        .unwrap();
    configuration
        .add_parameter(two, Parameter::new("retries", 5_i64))
        .unwrap();

    assert!(!configuration.is_locked(two, "retries"));
    assert_eq!(
        configuration.parameter(two, "retries").map(|p| p.value),
        Some(Value::Int(5))
    );
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[test]
fn constraints_order_handlers_across_phases() {
    let configuration = configuration(&["Transport", "Security", "Dispatch"]);
    let calls = Calls::default();
    let scope = Scope::operation("Service1", "echo");
    for (description, behavior) in [
        (HandlerDescription::new("h1", "Security").after("h2"), Behavior::Continue),
        (HandlerDescription::new("h2", "Security"), Behavior::Continue),
        (HandlerDescription::new("h3", "Transport").phase_first(), Behavior::Continue),
    ] {
        configuration
            .add_handler(&scope, Flow::In, calls.entry(description, behavior))
            .unwrap();
    }

    let chain = configuration.chain("Service1", "echo", Flow::In).unwrap();
    assert_eq!(chain.handler_names(), vec!["h3", "h2", "h1"]);
}

#[test]
fn competing_phase_first_claims_are_rejected() {
    let configuration = configuration(&["Security"]);
    let calls = Calls::default();
    configuration
        .add_handler(
            &Scope::Global,
            Flow::In,
            calls.entry(HandlerDescription::new("a", "Security").phase_first(), Behavior::Continue),
        )
        .unwrap();

    let err = configuration
        .add_handler(
            &Scope::operation("Service2", "echo"),
            Flow::In,
            calls.entry(HandlerDescription::new("b", "Security").phase_first(), Behavior::Continue),
        )
        .unwrap_err();

    assert!(matches!(err, ConfigError::PhaseOrderConflict { ref phase, .. } if phase == "Security"));
}

#[tokio::test]
async fn module_contributions_merge_into_declared_phases() {
    let configuration = configuration(&["A", "B"]);
    let calls = Calls::default();
    configuration
        .register_module(CountingModule {
            name: "m1",
            handlers: vec![calls.entry(HandlerDescription::new("h1", "A"), Behavior::Continue)],
            inits: Arc::new(AtomicU32::new(0)),
        })
        .unwrap();
    configuration
        .register_module(CountingModule {
            name: "m2",
            handlers: vec![
                calls.entry(HandlerDescription::new("h2", "A").after("h1"), Behavior::Continue),
                calls.entry(HandlerDescription::new("h3", "B").phase_first(), Behavior::Continue),
            ],
            inits: Arc::new(AtomicU32::new(0)),
        })
        .unwrap();
    configuration.engage("m2", &Scope::Global).await.unwrap();
    configuration.engage("m1", &Scope::Global).await.unwrap();

    let chain = configuration.chain("Service1", "echo", Flow::In).unwrap();

    assert_eq!(chain.handler_names(), vec!["h1", "h2", "h3"]);
    assert_eq!(chain.phases()[0].handler_names(), vec!["h1", "h2"]);
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pause_and_resume_never_repeat_handlers() {
    let configuration = configuration(&["Dispatch"]);
    let calls = Calls::default();
    let scope = Scope::operation("Service1", "echo");
    for (name, behavior) in [
        ("h1", Behavior::Continue),
        ("h2", Behavior::Pause),
        ("h3", Behavior::Continue),
    ] {
        configuration
            .add_handler(&scope, Flow::In, calls.entry(HandlerDescription::new(name, "Dispatch"), behavior))
            .unwrap();
    }
    let engine = Engine::new(Arc::new(configuration));
    let mut ctx = MessageContext::new("Service1", "echo", Flow::In);

    assert_eq!(engine.run(&mut ctx).await.unwrap(), ExchangeStatus::Paused);
    assert_eq!(ctx.state(), ExchangeState::Paused);
    assert_eq!(ctx.cursor(), 2);
    assert_eq!(calls.count("h3"), 0);

    let err = engine.run(&mut ctx).await.unwrap_err();
    assert!(matches!(
        err,
        ExecutionError::InvalidState {
            state: ExchangeState::Paused,
            ..
        }
    ));

    assert_eq!(engine.resume(&mut ctx).await.unwrap(), ExchangeStatus::Completed);
    assert_eq!(trace_of(&ctx), "h1,h2,h3");
    for name in ["h1", "h2", "h3"] {
        assert_eq!(calls.count(name), 1, "{name} ran more than once");
    }
}

#[tokio::test]
async fn handlers_rewrite_the_payload_in_order() {
    let configuration = configuration(&["Security", "Dispatch"]);
    let scope = Scope::operation("Service1", "echo");
    let upper = FnHandler::new(|ctx: &mut MessageContext| {
        let body = ctx.take_payload().unwrap_or_default();
        ctx.set_payload(Bytes::from(body.to_ascii_uppercase()));
        Ok(InvocationResponse::Continue)
    });
    let reply = FnHandler::new(|ctx: &mut MessageContext| {
        let body = ctx.take_payload().unwrap_or_default();
        let mut framed = b"<reply>".to_vec();
        framed.extend_from_slice(&body);
        framed.extend_from_slice(b"</reply>");
        ctx.set_payload(Bytes::from(framed));
        Ok(InvocationResponse::Continue)
    });
    configuration
        .add_handler(&scope, Flow::In, Arc::new(ChainEntry::new(HandlerDescription::new("reply", "Dispatch"), Arc::new(reply))))
        .unwrap();
    configuration
        .add_handler(&scope, Flow::In, Arc::new(ChainEntry::new(HandlerDescription::new("upper", "Security"), Arc::new(upper))))
        .unwrap();
    let engine = Engine::new(Arc::new(configuration));
    let mut ctx = MessageContext::new("Service1", "echo", Flow::In).with_payload(Bytes::from_static(b"ping"));

    engine.run(&mut ctx).await.unwrap();

    assert_eq!(ctx.payload().map(|b| b.as_ref()), Some(&b"<reply>PING</reply>"[..]));
}

#[tokio::test]
async fn fault_skips_remaining_handlers_and_runs_fault_flow() {
    let configuration = configuration(&["Dispatch"]);
    let calls = Calls::default();
    let scope = Scope::service("Service1");
    for (name, behavior) in [
        ("h1", Behavior::Continue),
        ("h2", Behavior::Fault),
        ("h3", Behavior::Continue),
    ] {
        configuration
            .add_handler(&scope, Flow::In, calls.entry(HandlerDescription::new(name, "Dispatch"), behavior))
            .unwrap();
    }
    configuration
        .add_handler(
            &scope,
            Flow::InFault,
            calls.entry(HandlerDescription::new("f1", "Dispatch"), Behavior::Continue),
        )
        .unwrap();
    let engine = Engine::new(Arc::new(configuration));
    let mut ctx = MessageContext::new("Service1", "echo", Flow::In);

    let status = engine.run(&mut ctx).await.unwrap();

    assert_eq!(status, ExchangeStatus::Completed);
    assert_eq!(ctx.active_flow(), Flow::InFault);
    assert_eq!(trace_of(&ctx), "h1,h2,f1");
    assert_eq!(calls.count("h3"), 0);
    let fault = ctx.fault().unwrap();
    assert_eq!(fault.get("kind").and_then(Value::as_str), Some("handler"));
    assert_eq!(fault.get("handler").and_then(Value::as_str), Some("h2"));
    assert_eq!(fault.get("phase").and_then(Value::as_str), Some("Dispatch"));
    assert_eq!(fault.get("message").and_then(Value::as_str), Some("h2 refused"));
}

#[tokio::test]
async fn fault_inside_fault_flow_is_unrecoverable() {
    let configuration = configuration(&["Dispatch"]);
    let calls = Calls::default();
    let scope = Scope::operation("Service2", "echo");
    configuration
        .add_handler(&scope, Flow::In, calls.entry(HandlerDescription::new("h1", "Dispatch"), Behavior::Fault))
        .unwrap();
    configuration
        .add_handler(&scope, Flow::InFault, calls.entry(HandlerDescription::new("f1", "Dispatch"), Behavior::Fault))
        .unwrap();
    configuration
        .add_handler(&scope, Flow::InFault, calls.entry(HandlerDescription::new("f2", "Dispatch"), Behavior::Continue))
        .unwrap();
    let engine = Engine::new(Arc::new(configuration));
    let mut ctx = MessageContext::new("Service2", "echo", Flow::In);

    let err = engine.run(&mut ctx).await.unwrap_err();

    assert!(matches!(err, ExecutionError::UnrecoverableFault { ref handler, .. } if handler == "f1"));
    assert_eq!(ctx.state(), ExchangeState::Faulted);
    assert_eq!(calls.count("f2"), 0);
    assert!(matches!(
        engine.resume(&mut ctx).await,
        Err(ExecutionError::InvalidState { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_exchanges_keep_independent_order() {
    let configuration = configuration(&["Dispatch"]);
    let calls = Calls::default();
    for (name, behavior) in [
        ("a", Behavior::Continue),
        ("b", Behavior::Pause),
        ("c", Behavior::Continue),
    ] {
        configuration
            .add_handler(&Scope::Global, Flow::In, calls.entry(HandlerDescription::new(name, "Dispatch"), behavior))
            .unwrap();
    }
    let engine = Engine::new(Arc::new(configuration));
    let barrier = Arc::new(Barrier::new(2));

    let tasks: Vec<_> = ["Service1", "Service2"]
        .into_iter()
        .map(|service| {
            let engine = engine.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let mut ctx = MessageContext::new(service, "echo", Flow::In);
                let first = engine.run(&mut ctx).await.unwrap();
                // Both exchanges are paused before either resumes.
                barrier.wait().await;
                let second = engine.resume(&mut ctx).await.unwrap();
                (first, second, ctx)
            })
        })
        .collect();

    for task in tasks {
        let (first, second, ctx) = task.await.unwrap();
        assert_eq!(first, ExchangeStatus::Paused);
        assert_eq!(second, ExchangeStatus::Completed);
        assert_eq!(trace_of(&ctx), "a,b,c");
    }
    assert_eq!(calls.count("a"), 2);
    assert_eq!(calls.count("c"), 2);
}

#[tokio::test]
async fn paused_exchange_can_be_cancelled() {
    let configuration = configuration(&["Dispatch"]);
    let calls = Calls::default();
    configuration
        .add_handler(&Scope::Global, Flow::In, calls.entry(HandlerDescription::new("wait", "Dispatch"), Behavior::Pause))
        .unwrap();
    configuration
        .add_handler(&Scope::Global, Flow::In, calls.entry(HandlerDescription::new("after", "Dispatch"), Behavior::Continue))
        .unwrap();
    let engine = Engine::new(Arc::new(configuration));
    let mut ctx = MessageContext::new("Service1", "echo", Flow::In);
    engine.run(&mut ctx).await.unwrap();

    engine.cancel(&mut ctx).unwrap();

    assert_eq!(ctx.state(), ExchangeState::Faulted);
    assert_eq!(ctx.fault().and_then(|f| f.get("kind")).and_then(Value::as_str), Some("cancelled"));
    assert!(engine.resume(&mut ctx).await.is_err());
    assert_eq!(calls.count("after"), 0);
}

// ---------------------------------------------------------------------------
// Engagement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn service_engagement_cycle_touches_only_that_service() {
    let configuration = configuration(&["Transport", "Security"]);
    let calls = Calls::default();
    let inits = Arc::new(AtomicU32::new(0));
    configuration
        .register_module(CountingModule {
            name: "security",
            handlers: vec![calls.entry(HandlerDescription::new("auth", "Security"), Behavior::Continue)],
            inits: Arc::clone(&inits),
        })
        .unwrap();
    configuration.resolve_all().unwrap();
    let other = configuration.cached_chain("Service2", "echo", Flow::In).unwrap();
    let scope = Scope::service("Service1");

    assert!(configuration.engage("security", &scope).await.unwrap());
    assert_eq!(
        configuration.chain("Service1", "echo", Flow::In).unwrap().handler_names(),
        vec!["auth"]
    );

    assert!(configuration.disengage("security", &scope).unwrap());
    assert!(configuration.cached_chain("Service1", "echo", Flow::In).is_none());
    assert!(configuration.chain("Service1", "echo", Flow::In).unwrap().is_empty());

    assert!(configuration.engage("security", &scope).await.unwrap());
    assert_eq!(
        configuration.chain("Service1", "echo", Flow::In).unwrap().handler_names(),
        vec!["auth"]
    );

    let still = configuration.cached_chain("Service2", "echo", Flow::In).unwrap();
    assert!(Arc::ptr_eq(&other, &still));
    assert_eq!(inits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_engagements_initialize_module_once() {
    let configuration = Arc::new(configuration(&["Transport"]));
    let calls = Calls::default();
    let inits = Arc::new(AtomicU32::new(0));
    configuration
        .register_module(CountingModule {
            name: "addressing",
            handlers: vec![calls.entry(HandlerDescription::new("addr", "Transport"), Behavior::Continue)],
            inits: Arc::clone(&inits),
        })
        .unwrap();

    let scopes = [
        Scope::service("Service1"),
        Scope::service("Service2"),
        Scope::operation("Service1", "echo"),
        Scope::operation("Service2", "echo"),
    ];
    let tasks: Vec<_> = scopes
        .into_iter()
        .map(|scope| {
            let configuration = Arc::clone(&configuration);
            tokio::spawn(async move { configuration.engage("addressing", &scope).await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().unwrap());
    }

    assert_eq!(inits.load(Ordering::SeqCst), 1);
    // Engaged at both service and operation: contributed once.
    assert_eq!(
        configuration.chain("Service1", "echo", Flow::In).unwrap().handler_names(),
        vec!["addr"]
    );
}

#[tokio::test]
async fn engagement_with_unknown_phase_is_rolled_back() {
    let configuration = configuration(&["Transport"]);
    let calls = Calls::default();
    configuration
        .register_module(CountingModule {
            name: "policy",
            handlers: vec![calls.entry(HandlerDescription::new("enforce", "Policy"), Behavior::Continue)],
            inits: Arc::new(AtomicU32::new(0)),
        })
        .unwrap();

    let err = configuration.engage("policy", &Scope::Global).await.unwrap_err();

    assert!(matches!(
        err,
        DeploymentError::Config(ConfigError::UnknownPhase { ref handler, .. }) if handler == "enforce"
    ));
    assert!(configuration.engaged_modules(&Scope::Global).unwrap().is_empty());
    assert!(configuration.chain("Service1", "echo", Flow::In).unwrap().is_empty());
}
