//! GraphQL resolver tables.
//!
//! Strategies contribute resolvers as a [`ResolverMap`]. Resolvers take the
//! authentication instance as an explicit argument; before the table is
//! handed to a GraphQL layer, [`bind_root_queries_and_mutations`] closes the
//! instance into every root query and mutation and nothing else.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use crate::context::RequestContext;
use crate::error::ResolverError;
use crate::passport::PassportCore;

/// Type names whose fields receive the authentication instance.
pub const ROOT_TYPES: [&str; 2] = ["RootMutation", "RootQuery"];

/// Arguments of a single resolver call.
#[derive(Debug, Clone, Default)]
pub struct ResolverArgs {
    /// The parent object (`root` for top-level fields).
    pub parent: Value,
    /// Field arguments.
    pub args: Value,
    /// Per-request context.
    pub context: RequestContext,
}

impl ResolverArgs {
    pub fn new(args: Value, context: RequestContext) -> Self {
        Self {
            parent: Value::Null,
            args,
            context,
        }
    }

    /// Required string argument.
    pub fn str_arg(&self, name: &str) -> Result<&str, ResolverError> {
        self.args
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| ResolverError::InvalidArgument(name.to_string()))
    }
}

pub type ResolverFuture = BoxFuture<'static, Result<Value, ResolverError>>;

/// Unbound resolver. The first argument is the authentication instance for
/// root fields and `None` everywhere else.
pub type Resolver = Arc<dyn Fn(Option<Arc<PassportCore>>, ResolverArgs) -> ResolverFuture + Send + Sync>;

/// Resolver ready for the GraphQL layer.
pub type BoundResolver = Arc<dyn Fn(ResolverArgs) -> ResolverFuture + Send + Sync>;

pub type ResolverMap = ResolverTree<Resolver>;
pub type BoundResolverMap = ResolverTree<BoundResolver>;

/// Wrap an async closure as a [`Resolver`].
pub fn resolver<F, Fut>(f: F) -> Resolver
where
    F: Fn(Option<Arc<PassportCore>>, ResolverArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ResolverError>> + Send + 'static,
{
    Arc::new(move |core, args| Box::pin(f(core, args)))
}

/// Wrap an async closure that needs the authentication instance.
/// Called unbound, it fails with [`ResolverError::Unbound`].
pub fn root_resolver<F, Fut>(f: F) -> Resolver
where
    F: Fn(Arc<PassportCore>, ResolverArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ResolverError>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |core, args| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            match core {
                Some(core) => f(core, args).await,
                None => Err(ResolverError::Unbound),
            }
        })
    })
}

/// A resolver function or a nested table.
#[derive(Clone)]
pub enum ResolverNode<F> {
    Field(F),
    Object(ResolverTree<F>),
}

/// Insertion-ordered resolver table.
#[derive(Clone)]
pub struct ResolverTree<F> {
    entries: Vec<(String, ResolverNode<F>)>,
}

impl<F> Default for ResolverTree<F> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<F> fmt::Debug for ResolverTree<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, node) in &self.entries {
            match node {
                ResolverNode::Field(_) => map.entry(key, &"<fn>"),
                ResolverNode::Object(tree) => map.entry(key, tree),
            };
        }
        map.finish()
    }
}

impl<F> ResolverTree<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&ResolverNode<F>> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, n)| n)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResolverNode<F>)> {
        self.entries.iter().map(|(k, n)| (k.as_str(), n))
    }

    /// Insert or replace an entry, keeping the original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, node: ResolverNode<F>) -> Option<ResolverNode<F>> {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, node)),
            None => {
                self.entries.push((key, node));
                None
            }
        }
    }

    /// Builder-style field insert.
    pub fn field(mut self, key: impl Into<String>, f: F) -> Self {
        self.insert(key, ResolverNode::Field(f));
        self
    }

    /// Builder-style object insert.
    pub fn object(mut self, key: impl Into<String>, tree: ResolverTree<F>) -> Self {
        self.insert(key, ResolverNode::Object(tree));
        self
    }

    /// Function at `type_name.field`.
    pub fn lookup(&self, type_name: &str, field: &str) -> Option<&F> {
        match self.get(type_name)? {
            ResolverNode::Object(tree) => match tree.get(field)? {
                ResolverNode::Field(f) => Some(f),
                ResolverNode::Object(_) => None,
            },
            ResolverNode::Field(_) => None,
        }
    }

    /// Deep-merge `other` into `self`. Objects merge key by key; any other
    /// collision is won by `other`.
    pub fn merge(&mut self, other: ResolverTree<F>) {
        self.merge_at("", other);
    }

    fn merge_at(&mut self, prefix: &str, other: ResolverTree<F>) {
        for (key, node) in other.entries {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            let existing = self.entries.iter_mut().find(|(k, _)| *k == key);
            match (existing, node) {
                (Some((_, ResolverNode::Object(mine))), ResolverNode::Object(theirs)) => {
                    mine.merge_at(&path, theirs);
                }
                (Some((_, slot)), node) => {
                    warn!(resolver = %path, "replacing previously registered resolver");
                    *slot = node;
                }
                (None, node) => self.entries.push((key, node)),
            }
        }
    }

    /// Map every function, telling the mapper the path it sits at.
    fn map_with_path<G>(&self, path: &mut Vec<String>, f: &mut impl FnMut(&[String], &F) -> G) -> ResolverTree<G> {
        let entries = self
            .entries
            .iter()
            .map(|(key, node)| {
                path.push(key.clone());
                let mapped = match node {
                    ResolverNode::Field(func) => ResolverNode::Field(f(path, func)),
                    ResolverNode::Object(tree) => ResolverNode::Object(tree.map_with_path(path, f)),
                };
                path.pop();
                (key.clone(), mapped)
            })
            .collect();
        ResolverTree { entries }
    }
}

impl BoundResolverMap {
    /// Invoke the resolver at `type_name.field`.
    pub async fn call(&self, type_name: &str, field: &str, args: ResolverArgs) -> Result<Value, ResolverError> {
        let resolver = self
            .lookup(type_name, field)
            .ok_or_else(|| ResolverError::NotFound(format!("{type_name}.{field}")))?;
        resolver(args).await
    }
}

/// Bind root queries and mutations to the authentication instance.
///
/// Only functions directly under `RootMutation` or `RootQuery` receive
/// `Some(instance)`; every other function keeps receiving `None`.
pub fn bind_root_queries_and_mutations(instance: &Arc<PassportCore>, resolvers: &ResolverMap) -> BoundResolverMap {
    resolvers.map_with_path(&mut Vec::new(), &mut |path, func| {
        let receiver = match path {
            [root, _field] if ROOT_TYPES.contains(&root.as_str()) => Some(Arc::clone(instance)),
            _ => None,
        };
        let func = Arc::clone(func);
        let bound: BoundResolver = Arc::new(move |args| func(receiver.clone(), args));
        bound
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_core;
    use serde_json::json;

    /// Reports whether it was called with the instance.
    fn receiver_probe() -> Resolver {
        resolver(|core, _args| async move {
            Ok(match core {
                Some(core) => json!({ "receiver": "instance", "root": core.config().root_url() }),
                None => json!({ "receiver": null }),
            })
        })
    }

    fn constant(value: Value) -> Resolver {
        resolver(move |_, _| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    #[tokio::test]
    async fn test_bind_only_root_types() {
        let core = test_core();
        let map = ResolverMap::new()
            .field("topLevel", receiver_probe())
            .object("RootQuery", ResolverMap::new().field("probe", receiver_probe()))
            .object("RootMutation", ResolverMap::new().field("probe", receiver_probe()))
            .object("ApUser", ResolverMap::new().field("probe", receiver_probe()));

        let bound = bind_root_queries_and_mutations(&core, &map);

        for root in ROOT_TYPES {
            let out = bound.call(root, "probe", ResolverArgs::default()).await.unwrap();
            assert_eq!(out["receiver"], "instance", "{root} should be bound");
        }

        let out = bound.call("ApUser", "probe", ResolverArgs::default()).await.unwrap();
        assert_eq!(out["receiver"], Value::Null);

        let Some(ResolverNode::Field(top)) = bound.get("topLevel") else {
            panic!("top-level resolver missing");
        };
        let out = top(ResolverArgs::default()).await.unwrap();
        assert_eq!(out["receiver"], Value::Null);
    }

    #[tokio::test]
    async fn test_bound_receiver_is_the_instance() {
        let core = test_core();
        let seen = Arc::new(std::sync::Mutex::new(None::<Arc<PassportCore>>));
        let seen_in = Arc::clone(&seen);
        let map = ResolverMap::new().object(
            "RootMutation",
            ResolverMap::new().field(
                "capture",
                resolver(move |core, _| {
                    *seen_in.lock().unwrap() = core;
                    async { Ok(Value::Null) }
                }),
            ),
        );

        let bound = bind_root_queries_and_mutations(&core, &map);
        bound
            .call("RootMutation", "capture", ResolverArgs::default())
            .await
            .unwrap();

        let captured = seen.lock().unwrap().clone().expect("receiver");
        assert!(Arc::ptr_eq(&captured, &core));
    }

    #[tokio::test]
    async fn test_deeper_nesting_is_not_bound() {
        let core = test_core();
        let map = ResolverMap::new().object(
            "RootQuery",
            ResolverMap::new().object("nested", ResolverMap::new().field("probe", receiver_probe())),
        );
        let bound = bind_root_queries_and_mutations(&core, &map);

        let Some(ResolverNode::Object(root)) = bound.get("RootQuery") else {
            panic!("RootQuery missing");
        };
        let Some(ResolverNode::Object(nested)) = root.get("nested") else {
            panic!("nested missing");
        };
        let Some(ResolverNode::Field(probe)) = nested.get("probe") else {
            panic!("probe missing");
        };
        let out = probe(ResolverArgs::default()).await.unwrap();
        assert_eq!(out["receiver"], Value::Null);
    }

    #[tokio::test]
    async fn test_root_resolver_requires_instance() {
        let needs_core = root_resolver(|_core, _args| async { Ok(json!(true)) });
        let err = needs_core(None, ResolverArgs::default()).await.unwrap_err();
        assert!(matches!(err, ResolverError::Unbound));
    }

    #[tokio::test]
    async fn test_merge_deep_and_ordered() {
        let mut map = ResolverMap::new()
            .object("RootQuery", ResolverMap::new().field("a", constant(json!("a1"))))
            .field("scalar", constant(json!("s1")));
        map.merge(
            ResolverMap::new()
                .object(
                    "RootQuery",
                    ResolverMap::new()
                        .field("b", constant(json!("b")))
                        .field("a", constant(json!("a2"))),
                )
                .object("RootMutation", ResolverMap::new().field("m", constant(json!("m")))),
        );

        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["RootQuery", "scalar", "RootMutation"]);

        let Some(ResolverNode::Object(query)) = map.get("RootQuery") else {
            panic!("RootQuery missing");
        };
        let fields: Vec<&str> = query.iter().map(|(k, _)| k).collect();
        assert_eq!(fields, vec!["a", "b"]);

        let a = map.lookup("RootQuery", "a").unwrap();
        assert_eq!(a(None, ResolverArgs::default()).await.unwrap(), json!("a2"));
    }

    #[tokio::test]
    async fn test_call_missing_resolver() {
        let bound = bind_root_queries_and_mutations(&test_core(), &ResolverMap::new());
        let err = bound
            .call("RootQuery", "nope", ResolverArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::NotFound(path) if path == "RootQuery.nope"));
    }

    #[test]
    fn test_str_arg() {
        let args = ResolverArgs::new(json!({ "email": "a@b.c", "n": 1 }), RequestContext::default());
        assert_eq!(args.str_arg("email").unwrap(), "a@b.c");
        assert!(matches!(args.str_arg("n"), Err(ResolverError::InvalidArgument(_))));
    }
}
