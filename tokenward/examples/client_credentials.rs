use std::{path::PathBuf, time::Duration};

use clap::Parser;
use tokenward::{
    dpop::ProofKey,
    endpoint::{ClientCredentialStyle, ClientCredentialsClient, ClientRegistry},
    ClientCredentialsTokenClient, ClientCredentialsTokenManagementOptions,
    ClientCredentialsTokenManager, ClientId, ClientName, ClientSecret, IssuedToken, Scope,
    TokenRequestParameters,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's token request URL
    #[arg(short, long, env)]
    token_url: reqwest::Url,

    /// The client ID of the client
    #[arg(short, long, env)]
    client_id: String,

    /// The client secret used to identify the client to the issuing authority
    #[arg(short = 's', long, env, hide_env_values = true)]
    client_secret: String,

    /// The scope to request a token for
    #[arg(long, env)]
    scope: Option<String>,

    /// Send the client secret using HTTP Basic authentication
    #[arg(long)]
    basic_auth: bool,

    /// A JWK file holding a private key to bind tokens to with DPoP
    #[arg(long, env, name = "FILE")]
    dpop_key_file: Option<PathBuf>,

    /// Seconds between token lookups
    #[arg(long, default_value_t = 5)]
    interval: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let dpop_key = match &opts.dpop_key_file {
        Some(path) => Some(ProofKey::from_jwk(&std::fs::read_to_string(path)?)?),
        None => None,
    };

    let name = ClientName::from_static("demo");
    let clients = ClientRegistry::new().with_client(
        name.clone(),
        ClientCredentialsClient {
            token_endpoint: Some(opts.token_url),
            client_id: Some(ClientId::new(opts.client_id)?),
            client_secret: Some(ClientSecret::new(opts.client_secret)?),
            credential_style: if opts.basic_auth {
                ClientCredentialStyle::AuthorizationHeader
            } else {
                ClientCredentialStyle::PostBody
            },
            scope: opts.scope.map(Scope::new).transpose()?,
            dpop_key,
            ..ClientCredentialsClient::default()
        },
    );

    let http = reqwest::Client::builder().https_only(true).build()?;
    let client = ClientCredentialsTokenClient::new(http, clients);
    let manager =
        ClientCredentialsTokenManager::new(client, ClientCredentialsTokenManagementOptions::default());

    let parameters = TokenRequestParameters::new();
    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        match manager.get_access_token(&name, &parameters).await {
            Ok(token) => tracing::info!(
                token = format_args!("{:#?}", token.access_token()),
                scheme = token.scheme(),
                expiration = %token.expiration(),
                "pulled token"
            ),
            Err(error) => tracing::error!(%error, "unable to obtain token"),
        }
    }
}
