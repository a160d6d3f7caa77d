use clap::Parser;
use contentguard::{
    ApplicationIdentity, BackendKind, LocalPolicyService, PolicyEndpoint, Right, StaticDiscovery,
    StorageConfig, TemplateDefinition, TemplateDescriptor, UserRights,
};
use std::path::PathBuf;

/// Protect and unprotect a line of text with a protection template
#[derive(Parser, Debug)]
#[command(name = "contentguard-quickstart", version)]
pub struct Args {
    /// Application (client) id registered with the identity provider
    #[arg(long, env = "CONTENTGUARD_APP_ID")]
    pub app_id: String,

    #[arg(long, env = "CONTENTGUARD_APP_NAME", default_value = "contentguard-quickstart")]
    pub app_name: String,

    #[arg(long, env = "CONTENTGUARD_APP_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub app_version: String,

    /// Redirect URI shown when signing in interactively
    #[arg(long, env = "CONTENTGUARD_REDIRECT_URI", default_value = "http://localhost")]
    pub redirect_uri: String,

    /// Talk to an on-premises policy server instead of the cloud service
    #[arg(long, env = "CONTENTGUARD_ON_PREMISES")]
    pub on_premises: bool,

    /// Directory for cached consent decisions
    #[arg(long, env = "CONTENTGUARD_CACHE_DIR", default_value = "mip_data")]
    pub cache_dir: PathBuf,

    /// User to sign in as (email / UPN); prompted for when absent
    #[arg(long, env = "CONTENTGUARD_USER")]
    pub user: Option<String>,

    /// Bearer token for the user; prompted for when absent
    #[arg(long, env = "CONTENTGUARD_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Policy endpoint URL; derived from the user's domain when absent
    #[arg(long, env = "CONTENTGUARD_POLICY_URL")]
    pub policy_url: Option<String>,

    /// JSON template catalogue served by the local policy backend
    #[arg(long, env = "CONTENTGUARD_CATALOGUE")]
    pub catalogue: Option<PathBuf>,

    /// Seconds to wait for sign-in and service discovery
    #[arg(long, env = "CONTENTGUARD_TIMEOUT_SECS", default_value_t = 120)]
    pub timeout_secs: u64,

    /// Print the license header after protecting
    #[arg(long)]
    pub show_license: bool,
}

impl Args {
    pub fn application(&self) -> ApplicationIdentity {
        ApplicationIdentity::new(&self.app_id, &self.app_name, &self.app_version)
    }

    pub fn backend(&self) -> BackendKind {
        if self.on_premises {
            BackendKind::OnPremises
        } else {
            BackendKind::Cloud
        }
    }

    pub fn storage(&self) -> StorageConfig {
        StorageConfig::on_disk(&self.cache_dir).with_backend(self.backend())
    }

    /// Endpoint serving `domain` for the selected backend
    pub fn endpoint(&self, domain: &str) -> PolicyEndpoint {
        let url = match (&self.policy_url, self.backend()) {
            (Some(url), _) => url.clone(),
            (None, BackendKind::Cloud) => format!("https://policy.{domain}"),
            (None, BackendKind::OnPremises) => format!("https://rms.{domain}"),
        };
        PolicyEndpoint::new(url, domain)
    }

    pub fn discovery(&self, domain: &str) -> StaticDiscovery {
        StaticDiscovery::new().with_endpoint(self.backend(), domain, self.endpoint(domain))
    }
}

/// Catalogue used when none is given: "Confidential" and "Secret" for the tenant
pub fn default_policy_service(domain: &str) -> LocalPolicyService {
    LocalPolicyService::new().with_tenant(
        domain,
        vec![
            TemplateDefinition::new(
                TemplateDescriptor::new("T1", "Confidential")
                    .with_description("Readable by everyone in the organization"),
                vec![UserRights::new([domain], [Right::View, Right::Print])],
            ),
            TemplateDefinition::new(
                TemplateDescriptor::new("T2", "Secret")
                    .with_description("Readable by the owner only"),
                Vec::new(),
            ),
        ],
    )
}
