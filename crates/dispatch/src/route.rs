use std::future::Future;
use std::sync::Arc;

use kube::core::DynamicObject;
use tether_core::{FieldSelector, Gvk, LabelSelector, ObjectId, SelectorError};

use crate::middleware::{handler_fn, ErrorPrefix, Handler, IgnoreFinalizing, IgnoreNil, IgnoreRemoved, Middleware};
use crate::{Request, Response};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route name must not be empty")]
    EmptyName,
    #[error("route {route}: no handler set")]
    MissingHandler { route: String },
    #[error("route {route}: invalid selector")]
    InvalidSelector {
        route: String,
        #[source]
        source: SelectorError,
    },
    #[error("route {route}: finalizer id must not be empty")]
    EmptyFinalizer { route: String },
    #[error("route {route}: finalizer {finalizer:?} has no finalize handler")]
    FinalizerWithoutHandler { route: String, finalizer: String },
    #[error("route {route}: finalize handler set without a finalizer id")]
    FinalizeHandlerWithoutFinalizer { route: String },
}

/// How a route's declared objects are applied after a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputPolicy {
    /// Subcontext; defaults to the route name.
    pub set_id: Option<String>,
    pub prune_kinds: Option<Vec<Gvk>>,
    pub no_prune: bool,
}

impl OutputPolicy {
    pub fn set_id(set_id: &str) -> Self { Self { set_id: Some(set_id.to_string()), ..Default::default() } }

    pub fn with_prune_kinds(mut self, kinds: impl IntoIterator<Item = Gvk>) -> Self {
        self.prune_kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn with_no_prune(mut self) -> Self {
        self.no_prune = true;
        self
    }
}

/// A registered reconciliation entry point. Immutable once built.
pub struct Route {
    pub(crate) name: Arc<str>,
    pub(crate) gvk: Gvk,
    namespace: Option<String>,
    object_name: Option<String>,
    labels: Option<LabelSelector>,
    fields: Option<FieldSelector>,
    pub(crate) chain: Arc<[Arc<dyn Middleware>]>,
    pub(crate) finalize_chain: Arc<[Arc<dyn Middleware>]>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) finalize_handler: Option<Arc<dyn Handler>>,
    pub(crate) finalizer: Option<String>,
    pub(crate) outputs: Option<OutputPolicy>,
}

impl Route {
    pub fn builder(name: &str, gvk: Gvk) -> RouteBuilder {
        RouteBuilder {
            name: name.to_string(),
            gvk,
            namespace: None,
            object_name: None,
            labels: None,
            fields: None,
            middleware: Vec::new(),
            handler: None,
            finalize_handler: None,
            finalizer: None,
            include_removed: false,
            include_finalizing: false,
            outputs: None,
            error_prefix: None,
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn gvk(&self) -> &Gvk { &self.gvk }
    pub fn finalizer(&self) -> Option<&str> { self.finalizer.as_deref() }
    pub fn outputs(&self) -> Option<&OutputPolicy> { self.outputs.as_ref() }

    /// Subcontext used for this route's declared objects.
    pub fn set_id(&self) -> &str {
        self.outputs.as_ref().and_then(|o| o.set_id.as_deref()).unwrap_or(&self.name)
    }

    /// Namespace/name filters use the key; label/field filters need the object.
    pub fn matches(&self, id: &ObjectId, object: Option<&DynamicObject>) -> bool {
        if id.gvk != self.gvk {
            return false;
        }
        if let Some(ns) = &self.namespace {
            if id.namespace() != Some(ns.as_str()) {
                return false;
            }
        }
        if let Some(name) = &self.object_name {
            if id.name() != name {
                return false;
            }
        }
        if let Some(sel) = &self.labels {
            match object {
                Some(o) if sel.matches_opt(o.metadata.labels.as_ref()) => {}
                _ => return false,
            }
        }
        if let Some(sel) = &self.fields {
            match object.and_then(|o| serde_json::to_value(o).ok()) {
                Some(v) if sel.matches(&v) => {}
                _ => return false,
            }
        }
        true
    }
}

pub struct RouteBuilder {
    name: String,
    gvk: Gvk,
    namespace: Option<String>,
    object_name: Option<String>,
    labels: Option<String>,
    fields: Option<String>,
    middleware: Vec<Arc<dyn Middleware>>,
    handler: Option<Arc<dyn Handler>>,
    finalize_handler: Option<Arc<dyn Handler>>,
    finalizer: Option<String>,
    include_removed: bool,
    include_finalizing: bool,
    outputs: Option<OutputPolicy>,
    error_prefix: Option<String>,
}

impl RouteBuilder {
    pub fn namespace(mut self, ns: &str) -> Self { self.namespace = Some(ns.to_string()); self }
    pub fn object_name(mut self, name: &str) -> Self { self.object_name = Some(name.to_string()); self }
    pub fn labels(mut self, selector: &str) -> Self { self.labels = Some(selector.to_string()); self }
    pub fn fields(mut self, selector: &str) -> Self { self.fields = Some(selector.to_string()); self }
    pub fn include_removed(mut self) -> Self { self.include_removed = true; self }
    pub fn include_finalizing(mut self) -> Self { self.include_finalizing = true; self }
    pub fn outputs(mut self, policy: OutputPolicy) -> Self { self.outputs = Some(policy); self }
    pub fn error_prefix(mut self, prefix: &str) -> Self { self.error_prefix = Some(prefix.to_string()); self }

    /// Appended after the default filters, in call order.
    pub fn middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.middleware.push(mw);
        self
    }

    pub fn handler(mut self, h: Arc<dyn Handler>) -> Self {
        self.handler = Some(h);
        self
    }

    pub fn handle<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handler(handler_fn(f))
    }

    /// Run `h` instead of the handler while the object is being deleted and still carries `finalizer`.
    pub fn finalizer(mut self, finalizer: &str, h: Arc<dyn Handler>) -> Self {
        self.finalizer = Some(finalizer.to_string());
        self.finalize_handler = Some(h);
        self
    }

    pub fn finalize<F, Fut>(self, finalizer: &str, f: F) -> Self
    where
        F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.finalizer(finalizer, handler_fn(f))
    }

    pub fn build(self) -> Result<Route, RouteError> {
        let route = self.name.clone();
        if route.trim().is_empty() {
            return Err(RouteError::EmptyName);
        }
        let handler = self.handler.ok_or_else(|| RouteError::MissingHandler { route: route.clone() })?;
        match (&self.finalizer, &self.finalize_handler) {
            (Some(f), _) if f.trim().is_empty() => return Err(RouteError::EmptyFinalizer { route }),
            (Some(f), None) => return Err(RouteError::FinalizerWithoutHandler { route, finalizer: f.clone() }),
            (None, Some(_)) => return Err(RouteError::FinalizeHandlerWithoutFinalizer { route }),
            _ => {}
        }
        let labels = match &self.labels {
            Some(s) => Some(s.parse::<LabelSelector>().map_err(|source| RouteError::InvalidSelector { route: route.clone(), source })?),
            None => None,
        };
        let fields = match &self.fields {
            Some(s) => Some(s.parse::<FieldSelector>().map_err(|source| RouteError::InvalidSelector { route: route.clone(), source })?),
            None => None,
        };

        let mut chain: Vec<Arc<dyn Middleware>> = Vec::new();
        let mut finalize_chain: Vec<Arc<dyn Middleware>> = Vec::new();
        if let Some(p) = &self.error_prefix {
            chain.push(Arc::new(ErrorPrefix(p.clone())));
            finalize_chain.push(Arc::new(ErrorPrefix(p.clone())));
        }
        chain.push(Arc::new(IgnoreNil));
        finalize_chain.push(Arc::new(IgnoreNil));
        if !self.include_removed {
            chain.push(Arc::new(IgnoreRemoved));
        }
        finalize_chain.push(Arc::new(IgnoreRemoved));
        if !self.include_finalizing {
            chain.push(Arc::new(IgnoreFinalizing));
        }
        chain.extend(self.middleware.iter().cloned());
        finalize_chain.extend(self.middleware.iter().cloned());

        Ok(Route {
            name: Arc::from(route.as_str()),
            gvk: self.gvk,
            namespace: self.namespace,
            object_name: self.object_name,
            labels,
            fields,
            chain: chain.into(),
            finalize_chain: finalize_chain.into(),
            handler,
            finalize_handler: self.finalize_handler,
            finalizer: self.finalizer,
            outputs: self.outputs,
        })
    }
}
