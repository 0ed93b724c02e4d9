//! Strategy registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::{Authenticator, BoundVerify, Strategy, StrategyInput, StrategyOptions};
use crate::error::{PassportError, Result};
use crate::modules::{ModuleKind, ModuleResolver};
use crate::passport::PassportCore;
use crate::resolvers::ResolverMap;

/// Name prefixes marking an OAuth-family strategy.
const OAUTH_PREFIXES: [&str; 2] = ["oauth2:", "oauth:"];

/// Provider part of an OAuth-family strategy name: `oauth2:github` → `github`.
pub fn oauth_provider(name: &str) -> Option<&str> {
    OAUTH_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .filter(|provider| !provider.is_empty())
}

/// A registered strategy. Immutable once registered.
#[derive(Clone)]
pub struct StrategyDescriptor {
    name: String,
    provider: String,
    strategy: Arc<dyn Strategy>,
    options: StrategyOptions,
    verify: Option<BoundVerify>,
    resolvers: ResolverMap,
    schema: Vec<String>,
    prebuilt: bool,
}

impl fmt::Debug for StrategyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyDescriptor")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("options", &self.options)
            .field("resolvers", &self.resolvers)
            .field("schema", &self.schema.len())
            .field("prebuilt", &self.prebuilt)
            .finish_non_exhaustive()
    }
}

impl StrategyDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Route segment under the auth path: the OAuth provider, or the name.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn strategy(&self) -> &Arc<dyn Strategy> {
        &self.strategy
    }

    pub fn options(&self) -> &StrategyOptions {
        &self.options
    }

    /// The verify function handed to the constructor. `None` for pre-built
    /// strategies.
    pub fn verify(&self) -> Option<&BoundVerify> {
        self.verify.as_ref()
    }

    pub fn resolvers(&self) -> &ResolverMap {
        &self.resolvers
    }

    pub fn schema(&self) -> &[String] {
        &self.schema
    }

    pub fn is_prebuilt(&self) -> bool {
        self.prebuilt
    }
}

/// Registered strategies plus the GraphQL surface they add up to.
#[derive(Default)]
pub struct StrategyRegistry {
    descriptors: Vec<StrategyDescriptor>,
    providers: HashMap<String, usize>,
    authenticators: HashMap<String, Authenticator>,
    resolvers: ResolverMap,
    schema: Vec<String>,
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names().collect::<Vec<_>>())
            .field("schema", &self.schema.len())
            .finish_non_exhaustive()
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add resolvers and schema not owned by any strategy.
    pub(crate) fn add_surface(&mut self, resolvers: ResolverMap, schema: Vec<String>) {
        self.resolvers.merge(resolvers);
        self.schema.extend(schema);
    }

    /// Register a strategy.
    ///
    /// Everything that can fail is computed before the transport is touched;
    /// if the transport rejects the registration-time `authenticate` call the
    /// strategy is unmounted again, so a failed call leaves nothing behind.
    #[instrument(skip(self, core, modules, input), fields(input = ?input))]
    pub fn register(
        &mut self,
        core: &Arc<PassportCore>,
        modules: &ModuleResolver,
        name: &str,
        input: StrategyInput,
    ) -> Result<&StrategyDescriptor> {
        if self.get(name).is_some() {
            return Err(PassportError::DuplicateStrategy(name.to_string()));
        }

        let descriptor = match input {
            StrategyInput::PreBuilt { factory, options } => {
                let options = options.unwrap_or_default();
                let built = factory(Arc::clone(core), options.clone())?;
                StrategyDescriptor {
                    name: name.to_string(),
                    provider: provider_segment(name),
                    strategy: built.strategy,
                    options,
                    verify: None,
                    resolvers: built.resolvers,
                    schema: built.schema,
                    prebuilt: true,
                }
            }
            StrategyInput::Basic {
                factory,
                options,
                verify,
            } => {
                let mut options = match options {
                    Some(options) => options,
                    None => modules
                        .require(name, ModuleKind::DefaultOptions)?
                        .into_default_options(name)?,
                };
                let verify = match verify {
                    Some(verify) => verify,
                    None => modules.require(name, ModuleKind::Verify)?.into_verify(name)?,
                };
                let verify = BoundVerify::new(Arc::clone(core), verify);

                if let Some(provider) = oauth_provider(name)
                    && options.callback_url().is_none()
                {
                    let callback = core.config().callback_url(provider);
                    debug!(strategy = %name, callback = %callback, "defaulting callbackURL");
                    options.insert("callbackURL", callback);
                }

                let factory = match factory {
                    Some(factory) => factory,
                    None => modules.require(name, ModuleKind::Index)?.into_index(name)?,
                };

                let resolvers = match modules.optional(name, ModuleKind::Resolvers)? {
                    Some(item) => item.into_resolvers(name)?,
                    None => ResolverMap::new(),
                };
                let schema = match modules.optional(name, ModuleKind::Schema)? {
                    Some(item) => item.into_schema(name)?,
                    None => Vec::new(),
                };

                let strategy = factory(options.clone(), verify.clone())?;
                StrategyDescriptor {
                    name: name.to_string(),
                    provider: provider_segment(name),
                    strategy,
                    options,
                    verify: Some(verify),
                    resolvers,
                    schema,
                    prebuilt: false,
                }
            }
        };

        let transport = core.transport();
        transport.use_strategy(name, Arc::clone(&descriptor.strategy));

        if descriptor.options.scope().is_some() {
            match transport.authenticate(name, descriptor.options.clone()) {
                Ok(authenticator) => {
                    self.authenticators.insert(name.to_string(), authenticator);
                }
                Err(e) => {
                    warn!(strategy = %name, error = %e, "registration-time authenticate failed");
                    transport.unuse(name);
                    return Err(e.into());
                }
            }
        }

        self.resolvers.merge(descriptor.resolvers.clone());
        self.schema.extend(descriptor.schema.iter().cloned());

        let index = self.descriptors.len();
        if self.providers.contains_key(&descriptor.provider) {
            warn!(provider = %descriptor.provider, strategy = %name, "provider route already taken; keeping the first");
        } else {
            self.providers.insert(descriptor.provider.clone(), index);
        }

        info!(strategy = %name, prebuilt = descriptor.prebuilt, "registered strategy");
        self.descriptors.push(descriptor);
        Ok(&self.descriptors[index])
    }

    pub fn get(&self, name: &str) -> Option<&StrategyDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    /// Strategy serving the `/<authPath>/<provider>` routes.
    pub fn for_provider(&self, provider: &str) -> Option<&StrategyDescriptor> {
        self.providers
            .get(provider)
            .map(|&index| &self.descriptors[index])
    }

    /// Authenticator created at registration time for scoped strategies.
    pub fn authenticator(&self, name: &str) -> Option<&Authenticator> {
        self.authenticators.get(name)
    }

    /// Strategy names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|d| d.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &StrategyDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Aggregate resolvers, unbound.
    pub fn resolvers(&self) -> &ResolverMap {
        &self.resolvers
    }

    /// Aggregate schema fragments in registration order.
    pub fn schema(&self) -> &[String] {
        &self.schema
    }
}

fn provider_segment(name: &str) -> String {
    oauth_provider(name).unwrap_or(name).to_string()
}
