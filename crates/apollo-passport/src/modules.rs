//! Strategy module registry.
//!
//! A strategy module bundles up to five exports (constructor, resolvers,
//! schema, verify, default options) under a strategy name. Modules are
//! registered explicitly; a full strategy name such as `oauth2:github` falls
//! back to its family module (`oauth2`) when no exact match exists.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ResolutionError;
use crate::resolvers::ResolverMap;
use crate::strategy::{StrategyFactory, StrategyOptions, VerifyFn};

/// Logical export of a strategy module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Index,
    Resolvers,
    Schema,
    Verify,
    DefaultOptions,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 5] = [
        Self::Index,
        Self::Resolvers,
        Self::Schema,
        Self::Verify,
        Self::DefaultOptions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Resolvers => "resolvers",
            Self::Schema => "schema",
            Self::Verify => "verify",
            Self::DefaultOptions => "defaultOptions",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown module kind '{s}'"))
    }
}

/// A loaded export.
#[derive(Clone)]
pub enum ModuleItem {
    Index(StrategyFactory),
    Resolvers(ResolverMap),
    Schema(Vec<String>),
    Verify(VerifyFn),
    DefaultOptions(StrategyOptions),
}

impl ModuleItem {
    pub fn kind(&self) -> ModuleKind {
        match self {
            Self::Index(_) => ModuleKind::Index,
            Self::Resolvers(_) => ModuleKind::Resolvers,
            Self::Schema(_) => ModuleKind::Schema,
            Self::Verify(_) => ModuleKind::Verify,
            Self::DefaultOptions(_) => ModuleKind::DefaultOptions,
        }
    }

    fn wrong_shape(strategy: &str, kind: ModuleKind) -> ResolutionError {
        ResolutionError::WrongShape {
            strategy: strategy.to_string(),
            kind,
        }
    }

    pub fn into_index(self, strategy: &str) -> Result<StrategyFactory, ResolutionError> {
        match self {
            Self::Index(factory) => Ok(factory),
            _ => Err(Self::wrong_shape(strategy, ModuleKind::Index)),
        }
    }

    pub fn into_resolvers(self, strategy: &str) -> Result<ResolverMap, ResolutionError> {
        match self {
            Self::Resolvers(map) => Ok(map),
            _ => Err(Self::wrong_shape(strategy, ModuleKind::Resolvers)),
        }
    }

    pub fn into_schema(self, strategy: &str) -> Result<Vec<String>, ResolutionError> {
        match self {
            Self::Schema(fragments) => Ok(fragments),
            _ => Err(Self::wrong_shape(strategy, ModuleKind::Schema)),
        }
    }

    pub fn into_verify(self, strategy: &str) -> Result<VerifyFn, ResolutionError> {
        match self {
            Self::Verify(verify) => Ok(verify),
            _ => Err(Self::wrong_shape(strategy, ModuleKind::Verify)),
        }
    }

    pub fn into_default_options(self, strategy: &str) -> Result<StrategyOptions, ResolutionError> {
        match self {
            Self::DefaultOptions(options) => Ok(options),
            _ => Err(Self::wrong_shape(strategy, ModuleKind::DefaultOptions)),
        }
    }
}

impl fmt::Debug for ModuleItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleItem::{}", self.kind())
    }
}

pub type ModuleBuilder = Arc<dyn Fn() -> ModuleItem + Send + Sync>;

/// How an export is authored: a ready value, or a builder producing it.
/// [`ModuleResolver::require`] hands back the value either way.
#[derive(Clone)]
pub enum ModuleExport {
    Value(ModuleItem),
    Builder(ModuleBuilder),
}

impl ModuleExport {
    fn load(&self) -> ModuleItem {
        match self {
            Self::Value(item) => item.clone(),
            Self::Builder(build) => build(),
        }
    }
}

/// Exports of a single strategy module.
#[derive(Clone, Default)]
pub struct StrategyModule {
    exports: HashMap<ModuleKind, ModuleExport>,
}

impl fmt::Debug for StrategyModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.exports.keys().map(ModuleKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("StrategyModule").field("exports", &kinds).finish()
    }
}

impl StrategyModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(self, factory: StrategyFactory) -> Self {
        self.export(ModuleExport::Value(ModuleItem::Index(factory)))
    }

    pub fn resolvers(self, resolvers: ResolverMap) -> Self {
        self.export(ModuleExport::Value(ModuleItem::Resolvers(resolvers)))
    }

    pub fn schema<I, S>(self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fragments = fragments.into_iter().map(Into::into).collect();
        self.export(ModuleExport::Value(ModuleItem::Schema(fragments)))
    }

    pub fn verify(self, verify: VerifyFn) -> Self {
        self.export(ModuleExport::Value(ModuleItem::Verify(verify)))
    }

    pub fn default_options(self, options: StrategyOptions) -> Self {
        self.export(ModuleExport::Value(ModuleItem::DefaultOptions(options)))
    }

    /// Register a builder for `kind`. The builder must produce an item of
    /// that kind; anything else is reported as [`ResolutionError::WrongShape`].
    pub fn builder(mut self, kind: ModuleKind, build: impl Fn() -> ModuleItem + Send + Sync + 'static) -> Self {
        self.exports.insert(kind, ModuleExport::Builder(Arc::new(build)));
        self
    }

    fn export(mut self, export: ModuleExport) -> Self {
        if let ModuleExport::Value(item) = &export {
            self.exports.insert(item.kind(), export);
        }
        self
    }

    pub fn has(&self, kind: ModuleKind) -> bool {
        self.exports.contains_key(&kind)
    }
}

/// A resolved reference to one export of one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    /// Name of the module that matched, possibly the family name.
    pub module: String,
    pub kind: ModuleKind,
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.kind)
    }
}

/// Maps strategy names to their modules.
#[derive(Debug, Clone, Default)]
pub struct ModuleResolver {
    modules: HashMap<String, StrategyModule>,
}

impl ModuleResolver {
    /// A resolver with no modules.
    pub fn new() -> Self {
        Self::default()
    }

    /// A resolver with the bundled `local` and `oauth2` modules.
    pub fn with_bundled() -> Self {
        let mut resolver = Self::new();
        resolver.register("local", crate::strategy::local::module());
        resolver.register("oauth2", crate::strategy::oauth2::module());
        resolver
    }

    /// Register (or replace) a module.
    pub fn register(&mut self, name: impl Into<String>, module: StrategyModule) -> &mut Self {
        self.modules.insert(name.into(), module);
        self
    }

    /// Module for a strategy name: exact match, then the family before `:`.
    fn module_for(&self, name: &str) -> Option<(&str, &StrategyModule)> {
        let family = name.split_once(':').map(|(family, _)| family);
        [Some(name), family]
            .into_iter()
            .flatten()
            .find_map(|candidate| {
                self.modules
                    .get_key_value(candidate)
                    .map(|(key, module)| (key.as_str(), module))
            })
    }

    /// Resolve `"<strategy>[/<kind>]"`. The kind defaults to `index`.
    /// Returns `None` when the module or the export does not exist.
    pub fn resolve(&self, path: &str) -> Option<ModuleRef> {
        let (name, kind) = match path.rsplit_once('/') {
            Some((name, kind)) => (name, kind.parse().ok()?),
            None => (path, ModuleKind::Index),
        };
        let (module_name, module) = self.module_for(name)?;
        module.has(kind).then(|| ModuleRef {
            module: module_name.to_string(),
            kind,
        })
    }

    /// Load a resolved export.
    pub fn load(&self, reference: &ModuleRef) -> Result<ModuleItem, ResolutionError> {
        let export = self
            .modules
            .get(&reference.module)
            .and_then(|module| module.exports.get(&reference.kind))
            .ok_or_else(|| ResolutionError::MissingExport {
                strategy: reference.module.clone(),
                kind: reference.kind,
            })?;

        let item = export.load();
        if item.kind() != reference.kind {
            return Err(ResolutionError::WrongShape {
                strategy: reference.module.clone(),
                kind: reference.kind,
            });
        }
        Ok(item)
    }

    /// Resolve then load; failing to resolve is an error.
    pub fn require(&self, strategy: &str, kind: ModuleKind) -> Result<ModuleItem, ResolutionError> {
        let reference = self.resolve(&format!("{strategy}/{kind}")).ok_or_else(|| {
            if self.module_for(strategy).is_some() {
                ResolutionError::MissingExport {
                    strategy: strategy.to_string(),
                    kind,
                }
            } else {
                ResolutionError::UnknownStrategy(strategy.to_string())
            }
        })?;
        self.load(&reference)
    }

    /// Like [`require`](Self::require) but a missing export is `Ok(None)`.
    pub fn optional(&self, strategy: &str, kind: ModuleKind) -> Result<Option<ModuleItem>, ResolutionError> {
        match self.resolve(&format!("{strategy}/{kind}")) {
            Some(reference) => self.load(&reference).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fake_module() -> StrategyModule {
        StrategyModule::new()
            .default_options(StrategyOptions::new().with("fake", true))
            .schema(["type Fake { id: ID }"])
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in ModuleKind::ALL {
            assert_eq!(kind.as_str().parse::<ModuleKind>(), Ok(kind));
        }
        assert!("nope".parse::<ModuleKind>().is_err());
        assert_eq!(ModuleKind::DefaultOptions.to_string(), "defaultOptions");
    }

    #[test]
    fn test_resolve_exact_and_family() {
        let mut resolver = ModuleResolver::new();
        resolver.register("oauth2", fake_module());

        let reference = resolver.resolve("oauth2:github/defaultOptions").unwrap();
        assert_eq!(reference.module, "oauth2");
        assert_eq!(reference.kind, ModuleKind::DefaultOptions);
        assert_eq!(reference.to_string(), "oauth2/defaultOptions");

        resolver.register("oauth2:github", StrategyModule::new().schema(["type Gh { id: ID }"]));
        let reference = resolver.resolve("oauth2:github/schema").unwrap();
        assert_eq!(reference.module, "oauth2:github");
    }

    #[test]
    fn test_resolve_missing() {
        let mut resolver = ModuleResolver::new();
        resolver.register("fake", fake_module());

        assert_eq!(resolver.resolve("nope/schema"), None);
        assert_eq!(resolver.resolve("fake/verify"), None);
        assert_eq!(resolver.resolve("fake/bogus"), None);
        // index is the default kind and `fake` has none
        assert_eq!(resolver.resolve("fake"), None);
    }

    #[test]
    fn test_require_errors() {
        let mut resolver = ModuleResolver::new();
        resolver.register("fake", fake_module());

        let err = resolver.require("nope", ModuleKind::Verify).unwrap_err();
        assert_eq!(err, ResolutionError::UnknownStrategy("nope".to_string()));

        let err = resolver.require("fake", ModuleKind::Verify).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::MissingExport {
                strategy: "fake".to_string(),
                kind: ModuleKind::Verify,
            }
        );

        assert!(resolver.optional("fake", ModuleKind::Verify).unwrap().is_none());
    }

    #[test]
    fn test_builder_and_value_load_the_same() {
        let mut resolver = ModuleResolver::new();
        resolver.register("value", fake_module());
        resolver.register(
            "built",
            StrategyModule::new().builder(ModuleKind::DefaultOptions, || {
                ModuleItem::DefaultOptions(StrategyOptions::new().with("fake", true))
            }),
        );

        let from_value = resolver
            .require("value", ModuleKind::DefaultOptions)
            .unwrap()
            .into_default_options("value")
            .unwrap();
        let from_builder = resolver
            .require("built", ModuleKind::DefaultOptions)
            .unwrap()
            .into_default_options("built")
            .unwrap();

        assert_eq!(from_value, from_builder);
        assert_eq!(from_value.get("fake"), Some(&json!(true)));
    }

    #[test]
    fn test_builder_with_wrong_shape() {
        let mut resolver = ModuleResolver::new();
        resolver.register(
            "broken",
            StrategyModule::new().builder(ModuleKind::Verify, || ModuleItem::Schema(vec![])),
        );

        let err = resolver.require("broken", ModuleKind::Verify).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::WrongShape {
                strategy: "broken".to_string(),
                kind: ModuleKind::Verify,
            }
        );
    }

    #[test]
    fn test_bundled_modules() {
        let resolver = ModuleResolver::with_bundled();
        for kind in ModuleKind::ALL {
            assert!(resolver.resolve(&format!("local/{kind}")).is_some(), "local/{kind}");
        }
        assert!(resolver.resolve("oauth2:facebook/verify").is_some());
        assert!(resolver.resolve("oauth2:facebook/defaultOptions").is_some());
        assert!(resolver.resolve("oauth2:facebook").is_none());
    }
}
