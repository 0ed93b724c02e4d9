//! The authentication instance.
//!
//! [`ApolloPassport`] is what applications build and register strategies
//! on. [`PassportCore`] is the part shared with strategies at runtime: verify
//! functions and root resolvers receive it as an explicit argument.

use std::fmt;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::config::{PassportConfig, PassportOptions};
use crate::context::{ContextWrapper, OptionsSource};
use crate::error::{ConfigurationError, ResolverError, Result};
use crate::modules::{ModuleResolver, StrategyModule};
use crate::resolvers::{BoundResolverMap, ResolverArgs, ResolverMap, bind_root_queries_and_mutations, root_resolver};
use crate::strategy::{
    AuthTransport, PassportTransport, PreBuiltFactory, StrategyDescriptor, StrategyFactory, StrategyInput,
    StrategyOptions, StrategyRegistry, VerifyFn,
};
use crate::token::{TokenError, TokenService};
use crate::user::{UserRecord, UserStore};

/// Schema types the passport itself contributes.
pub const CORE_SCHEMA: &str = r#"type ApUserEmail {
  address: String!
  verified: Boolean
}

type ApUser {
  id: ID!
  displayName: String
  emails: [ApUserEmail]
}

type ApLoginResult {
  token: String
  error: String
}

extend type RootQuery {
  apCurrentUser: ApUser
}
"#;

/// Shared runtime state: configuration, db, tokens and the transport.
pub struct PassportCore {
    config: PassportConfig,
    db: Arc<dyn UserStore>,
    tokens: TokenService,
    transport: Arc<dyn AuthTransport>,
}

impl fmt::Debug for PassportCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassportCore")
            .field("config", &self.config)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

impl PassportCore {
    /// Validate options and build the shared state.
    pub fn from_options(options: PassportOptions) -> Result<Self, ConfigurationError> {
        let validated = options.validate()?;

        let mut tokens = TokenService::new(validated.config.jwt_secret(), validated.config.token_ttl());
        if let Some(mapper) = validated.map_user_to_user_id {
            tokens = tokens.with_user_id_mapper(mapper);
        }
        if let Some(mapper) = validated.map_user_to_jwt_props {
            tokens = tokens.with_jwt_props_mapper(mapper);
        }

        let transport = validated
            .transport
            .unwrap_or_else(|| Arc::new(PassportTransport::new()));

        Ok(Self {
            config: validated.config,
            db: validated.db,
            tokens,
            transport,
        })
    }

    pub fn config(&self) -> &PassportConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<dyn UserStore> {
        &self.db
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn transport(&self) -> &Arc<dyn AuthTransport> {
        &self.transport
    }

    pub fn user_id(&self, user: &UserRecord) -> Option<Value> {
        self.tokens.user_id(user)
    }

    pub fn create_token_from_user(&self, user: &UserRecord) -> Result<String, TokenError> {
        self.tokens.create_token_from_user(user)
    }
}

/// Application-facing passport.
///
/// Register strategies during startup, then wrap it in an `Arc` and hand it
/// to the server.
pub struct ApolloPassport {
    core: Arc<PassportCore>,
    modules: ModuleResolver,
    registry: StrategyRegistry,
}

impl fmt::Debug for ApolloPassport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApolloPassport")
            .field("core", &self.core)
            .field("modules", &self.modules)
            .field("registry", &self.registry)
            .finish()
    }
}

impl ApolloPassport {
    /// Build a passport with the bundled strategy modules.
    pub fn new(options: PassportOptions) -> Result<Self, ConfigurationError> {
        Self::with_modules(options, ModuleResolver::with_bundled())
    }

    /// Build a passport resolving strategy modules through `modules`.
    pub fn with_modules(options: PassportOptions, modules: ModuleResolver) -> Result<Self, ConfigurationError> {
        let core = Arc::new(PassportCore::from_options(options)?);

        let mut registry = StrategyRegistry::new();
        registry.add_surface(core_resolvers(), vec![CORE_SCHEMA.to_string()]);

        debug!(
            root_url = %core.config().root_url(),
            auth_path = %core.config().auth_path(),
            "passport configured"
        );

        Ok(Self {
            core,
            modules,
            registry,
        })
    }

    /// The authentication instance.
    pub fn instance(&self) -> &Arc<PassportCore> {
        &self.core
    }

    pub fn config(&self) -> &PassportConfig {
        self.core.config()
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Register a strategy module by name.
    pub fn register_module(&mut self, name: impl Into<String>, module: StrategyModule) -> &mut Self {
        self.modules.register(name, module);
        self
    }

    #[instrument(skip(self, input))]
    pub fn use_strategy(&mut self, name: &str, input: StrategyInput) -> Result<&StrategyDescriptor> {
        self.registry.register(&self.core, &self.modules, name, input)
    }

    /// Constructor, options and verify all from the strategy's module.
    pub fn use_module(&mut self, name: &str) -> Result<&StrategyDescriptor> {
        self.use_strategy(name, StrategyInput::from_module())
    }

    /// Explicit constructor; options and verify from the module.
    pub fn use_basic(&mut self, name: &str, factory: StrategyFactory) -> Result<&StrategyDescriptor> {
        self.use_strategy(name, StrategyInput::basic(factory))
    }

    pub fn use_with_options(
        &mut self,
        name: &str,
        factory: StrategyFactory,
        options: StrategyOptions,
    ) -> Result<&StrategyDescriptor> {
        self.use_strategy(name, StrategyInput::basic(factory).options(options))
    }

    pub fn use_with_verify(
        &mut self,
        name: &str,
        factory: StrategyFactory,
        verify: VerifyFn,
    ) -> Result<&StrategyDescriptor> {
        self.use_strategy(name, StrategyInput::basic(factory).verify(verify))
    }

    pub fn use_with_options_and_verify(
        &mut self,
        name: &str,
        factory: StrategyFactory,
        options: StrategyOptions,
        verify: VerifyFn,
    ) -> Result<&StrategyDescriptor> {
        self.use_strategy(name, StrategyInput::basic(factory).options(options).verify(verify))
    }

    /// Register a pre-built strategy. No defaults are injected.
    pub fn use_prebuilt(
        &mut self,
        name: &str,
        factory: PreBuiltFactory,
        options: Option<StrategyOptions>,
    ) -> Result<&StrategyDescriptor> {
        let input = match options {
            Some(options) => StrategyInput::prebuilt(factory).options(options),
            None => StrategyInput::prebuilt(factory),
        };
        self.use_strategy(name, input)
    }

    pub fn strategy(&self, name: &str) -> Option<&StrategyDescriptor> {
        self.registry.get(name)
    }

    /// Schema fragments: the passport's own, then each strategy's in
    /// registration order.
    pub fn schema(&self) -> &[String] {
        self.registry.schema()
    }

    /// Aggregate resolvers as registered, before binding.
    pub fn unbound_resolvers(&self) -> &ResolverMap {
        self.registry.resolvers()
    }

    /// Resolvers ready for the GraphQL layer.
    pub fn resolvers(&self) -> BoundResolverMap {
        bind_root_queries_and_mutations(&self.core, self.registry.resolvers())
    }

    /// Wrap a GraphQL options source with bearer-token context injection.
    pub fn wrap_options(&self, options: OptionsSource) -> ContextWrapper {
        ContextWrapper::new(self.core.tokens().clone(), options)
    }
}

fn core_resolvers() -> ResolverMap {
    ResolverMap::new().object(
        "RootQuery",
        ResolverMap::new().field("apCurrentUser", root_resolver(current_user)),
    )
}

async fn current_user(core: Arc<PassportCore>, args: ResolverArgs) -> Result<Value, ResolverError> {
    let Some(user_id) = args.context.auth.as_ref().and_then(|claims| claims.user_id()) else {
        return Ok(Value::Null);
    };

    let user = core
        .db()
        .fetch_user_by_id(user_id)
        .await
        .map_err(crate::error::StrategyError::from)?;

    Ok(match user {
        Some(user) => {
            let mut out = user.into_value();
            if let Value::Object(map) = &mut out {
                map.entry("id").or_insert_with(|| json!(user_id));
                map.remove("services");
            }
            out
        }
        None => Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::error::{PassportError, ResolutionError};
    use crate::resolvers::resolver;
    use crate::strategy::{AuthOutcome, AuthRequest, BoundVerify, Strategy, verify_fn};
    use crate::test_support::{FakeStrategy, SECRET, fake_factory, test_options};
    use crate::user::MemoryUserStore;
    use std::sync::Mutex;

    /// A module whose default verify reports the instance it was called with.
    fn self_reporting_module() -> StrategyModule {
        StrategyModule::new()
            .default_options(StrategyOptions::new())
            .verify(verify_fn(|core, _args| async move {
                Ok(Some(
                    UserRecord::new().with("self", core.config().auth_url_root().to_string()),
                ))
            }))
    }

    #[test]
    fn test_construction_failures() {
        let err = ApolloPassport::new(PassportOptions {
            db: None,
            ..test_options()
        })
        .unwrap_err();
        assert_eq!(err, ConfigurationError::MissingDb);

        let err = ApolloPassport::new(PassportOptions {
            jwt_secret: None,
            ..test_options()
        })
        .unwrap_err();
        assert_eq!(err, ConfigurationError::MissingJwtSecret);

        let err = ApolloPassport::new(
            PassportOptions {
                root_url: None,
                ..test_options()
            }
            .root_url_sources(vec![]),
        )
        .unwrap_err();
        assert_eq!(err, ConfigurationError::MissingRootUrl);
    }

    #[test]
    fn test_root_url_and_auth_path() {
        let passport = ApolloPassport::new(test_options().root_url("ROOT_URL").auth_path("/hello")).unwrap();
        assert_eq!(passport.config().root_url(), "ROOT_URL/");
        assert_eq!(passport.config().auth_path(), "hello");
        assert_eq!(passport.config().auth_url_root(), "ROOT_URL/hello");
    }

    #[tokio::test]
    async fn test_default_verify_is_bound_to_instance() {
        let mut passport = ApolloPassport::with_modules(test_options(), ModuleResolver::new()).unwrap();
        passport.register_module("selfish", self_reporting_module());

        let captured: Arc<Mutex<Option<BoundVerify>>> = Arc::new(Mutex::new(None));
        let captured_in = Arc::clone(&captured);
        let factory: StrategyFactory = Arc::new(move |_options, verify| {
            *captured_in.lock().unwrap() = Some(verify);
            let strategy: Arc<dyn Strategy> = Arc::new(FakeStrategy::new(None));
            Ok(strategy)
        });

        passport.use_basic("selfish", factory).unwrap();

        let verify = captured.lock().unwrap().clone().expect("verify handed to constructor");
        assert!(Arc::ptr_eq(verify.instance(), passport.instance()));

        let user = verify.call(Value::Null).await.unwrap().unwrap();
        assert_eq!(user.get_str("self"), Some(passport.config().auth_url_root()));
    }

    #[test]
    fn test_oauth2_callback_url_default() {
        let mut passport = ApolloPassport::new(test_options()).unwrap();

        let descriptor = passport
            .use_with_options("oauth2:fake", fake_factory(), StrategyOptions::new())
            .unwrap();
        assert_eq!(
            descriptor.options().callback_url(),
            Some("http://localhost:3000/ap-auth/fake/callback")
        );

        let descriptor = passport
            .use_with_options(
                "oauth2:explicit",
                fake_factory(),
                StrategyOptions::new().with("callbackURL", "https://elsewhere/cb"),
            )
            .unwrap();
        assert_eq!(descriptor.options().callback_url(), Some("https://elsewhere/cb"));
    }

    #[test]
    fn test_explicit_verify_skips_module_verify() {
        let mut passport = ApolloPassport::with_modules(test_options(), ModuleResolver::new()).unwrap();
        let verify = verify_fn(|_, _| async { Ok(None) });

        // no module at all: options missing must fail, options given must not
        let err = passport
            .use_with_verify("nomodule", fake_factory(), verify.clone())
            .unwrap_err();
        assert!(matches!(err, PassportError::Resolution(ResolutionError::UnknownStrategy(_))));

        passport
            .use_with_options_and_verify("nomodule", fake_factory(), StrategyOptions::new(), verify)
            .unwrap();
        assert!(passport.strategy("nomodule").is_some());
    }

    #[test]
    fn test_schema_order() {
        let mut passport = ApolloPassport::new(test_options()).unwrap();
        passport.use_module("local").unwrap();

        let schema = passport.schema();
        assert_eq!(schema[0], CORE_SCHEMA);
        assert!(schema[1].contains("apLoginEmailPassword"));
    }

    #[tokio::test]
    async fn test_resolvers_are_bound() {
        let mut passport = ApolloPassport::with_modules(test_options(), ModuleResolver::new()).unwrap();
        passport.register_module(
            "probe",
            StrategyModule::new()
                .index(fake_factory())
                .default_options(StrategyOptions::new())
                .verify(verify_fn(|_, _| async { Ok(None) }))
                .resolvers(ResolverMap::new().object(
                    "RootMutation",
                    ResolverMap::new().field(
                        "probe",
                        resolver(|core, _| async move { Ok(json!(core.is_some())) }),
                    ),
                )),
        );
        passport.use_module("probe").unwrap();

        let bound = passport.resolvers();
        let out = bound
            .call("RootMutation", "probe", ResolverArgs::default())
            .await
            .unwrap();
        assert_eq!(out, json!(true));

        let unbound = passport.unbound_resolvers().lookup("RootMutation", "probe").unwrap();
        assert_eq!(unbound(None, ResolverArgs::default()).await.unwrap(), json!(false));
    }

    #[tokio::test]
    async fn test_current_user() {
        let db = Arc::new(MemoryUserStore::new());
        let id = db
            .create_user(UserRecord::new().with("displayName", "Ada"))
            .await
            .unwrap();
        let passport = ApolloPassport::new(test_options().db(db)).unwrap();
        let resolvers = passport.resolvers();

        let anonymous = resolvers
            .call("RootQuery", "apCurrentUser", ResolverArgs::default())
            .await
            .unwrap();
        assert_eq!(anonymous, Value::Null);

        let token = passport
            .instance()
            .tokens()
            .sign(json!({ "userId": id }).as_object().cloned().unwrap_or_default())
            .unwrap();
        let claims = passport.instance().tokens().verify(&token).unwrap();
        let context = RequestContext {
            auth: Some(claims),
            ..RequestContext::default()
        };

        let user = resolvers
            .call("RootQuery", "apCurrentUser", ResolverArgs::new(Value::Null, context))
            .await
            .unwrap();
        assert_eq!(user["displayName"], "Ada");
        assert_eq!(user["id"], id);
    }

    #[tokio::test]
    async fn test_scoped_strategy_authenticates_at_registration() {
        let mut passport = ApolloPassport::new(test_options()).unwrap();
        passport
            .use_with_options(
                "oauth2:scoped",
                fake_factory(),
                StrategyOptions::new().with("scope", "email"),
            )
            .unwrap();

        let authenticator = passport
            .registry()
            .authenticator("oauth2:scoped")
            .expect("authenticator");
        let outcome = authenticator.run(&AuthRequest::default()).await.unwrap();
        assert!(matches!(outcome, AuthOutcome::Fail { .. }));
    }

    #[test]
    fn test_secret_reaches_token_service() {
        let passport = ApolloPassport::new(test_options()).unwrap();
        let token = passport
            .instance()
            .create_token_from_user(&UserRecord::new().with("id", 7))
            .unwrap();
        let other = TokenService::new(SECRET, passport.config().token_ttl());
        assert_eq!(other.verify(&token).unwrap().user_id(), Some(&json!(7)));
    }
}
