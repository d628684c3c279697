//! The six-stage deployment pipeline and its drivers
//!
//! Stages run strictly in order on deploy and in inverse order on destroy;
//! each stage resolves everything it needs from AWS, so any single stage
//! can be re-run on its own.

use crate::{aws, config::Config, error::Error, util};
use tracing::info;

pub mod common;
mod emr;
mod infra;
mod jobs;
mod shs;
mod ssl;
mod vpn;

/// One stage of the pipeline, in deploy order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Infra,
    Emr,
    Jobs,
    Ssl,
    Shs,
    Vpn,
}

impl Stage {
    /// All stages in deploy order
    pub const ALL: [Stage; 6] = [
        Stage::Infra,
        Stage::Emr,
        Stage::Jobs,
        Stage::Ssl,
        Stage::Shs,
        Stage::Vpn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Infra => "infra",
            Stage::Emr => "emr",
            Stage::Jobs => "jobs",
            Stage::Ssl => "ssl",
            Stage::Shs => "shs",
            Stage::Vpn => "vpn",
        }
    }

    pub fn parse(value: &str) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.as_str() == value)
    }
}

/// Tools the deploy path shells out to, with their version probes
const DEPLOY_TOOLS: [(&str, &[&str]); 4] = [
    ("aws", &["--version"]),
    ("docker", &["--version"]),
    ("helm", &["version"]),
    ("kubectl", &["version", "--client"]),
];

/// Tools the destroy path shells out to
const DESTROY_TOOLS: [(&str, &[&str]); 2] = [("aws", &["--version"]), ("helm", &["version"])];

/// Deploys every stage in order, or just the named one
pub async fn deploy(config: &Config, only: Option<Stage>) -> Result<(), Error> {
    util::ensure_tools(&DEPLOY_TOOLS).await?;
    let aws = aws::sdk_config(aws::Region::new(config.region.clone())).await;
    let account = aws::account_id(&aws).await?;
    info!(
        deployment = config.name.as_str(),
        region = config.region.as_str(),
        account = account.as_str(),
        "starting deploy"
    );

    for stage in Stage::ALL {
        if only.is_some_and(|s| s != stage) {
            continue;
        }
        info!(stage = stage.as_str(), "deploying stage");
        match stage {
            Stage::Infra => infra::deploy(config, &aws, &account).await?,
            Stage::Emr => emr::deploy(config, &aws, &account).await?,
            Stage::Jobs => jobs::deploy(config, &aws, &account).await?,
            Stage::Ssl => ssl::deploy(config, &aws, &account).await?,
            Stage::Shs => shs::deploy(config, &aws, &account).await?,
            Stage::Vpn => vpn::deploy(config, &aws, &account).await?,
        }
        info!(stage = stage.as_str(), "stage deployed");
    }
    info!(deployment = config.name.as_str(), "deploy complete");
    Ok(())
}

/// Destroys every stage in inverse order, or just the named one
pub async fn destroy(config: &Config, only: Option<Stage>) -> Result<(), Error> {
    util::ensure_tools(&DESTROY_TOOLS).await?;
    let aws = aws::sdk_config(aws::Region::new(config.region.clone())).await;
    let account = aws::account_id(&aws).await?;
    info!(
        deployment = config.name.as_str(),
        region = config.region.as_str(),
        account = account.as_str(),
        "starting destroy"
    );

    for stage in Stage::ALL.iter().rev() {
        if only.is_some_and(|s| s != *stage) {
            continue;
        }
        info!(stage = stage.as_str(), "destroying stage");
        match stage {
            Stage::Vpn => vpn::destroy(config, &aws, &account).await?,
            Stage::Shs => shs::destroy(config, &aws, &account).await?,
            Stage::Ssl => ssl::destroy(config, &aws, &account).await?,
            Stage::Jobs => jobs::destroy(config, &aws, &account).await?,
            Stage::Emr => emr::destroy(config, &aws, &account).await?,
            Stage::Infra => infra::destroy(config, &aws, &account).await?,
        }
        info!(stage = stage.as_str(), "stage destroyed");
    }
    info!(deployment = config.name.as_str(), "destroy complete");
    Ok(())
}

/// Reports the state of every stage's resources without mutating anything
pub async fn status(config: &Config) -> Result<(), Error> {
    let aws = aws::sdk_config(aws::Region::new(config.region.clone())).await;
    let account = aws::account_id(&aws).await?;

    let cfn = aws::cloudformation_client(&aws);
    for stack in [config.network_stack(), config.logs_stack()] {
        let state = aws::cloudformation::stack_state(&cfn, &stack).await?;
        info!(stack = stack.as_str(), state = ?state, "stack");
    }

    let eks_client = aws::eks_client(&aws);
    let mut clusters: Vec<String> = config
        .clusters
        .iter()
        .map(|c| config.eks_cluster(&c.name))
        .collect();
    clusters.push(config.eks_cluster(&config.shs.cluster));
    for cluster in clusters {
        let state = aws::eks::cluster_status(&eks_client, &cluster)
            .await?
            .unwrap_or_else(|| "ABSENT".to_string());
        info!(cluster = cluster.as_str(), state = state.as_str(), "EKS cluster");
    }

    let emr_client = aws::emr_client(&aws);
    for cluster in &config.clusters {
        let ids =
            emr::active_virtual_clusters(&emr_client, &config.eks_cluster(&cluster.name)).await?;
        info!(
            cluster = cluster.name.as_str(),
            virtual_clusters = ids.len(),
            "EMR virtual clusters"
        );
    }

    let pca_client = aws::pca_client(&aws);
    let ca = aws::resolve::find_certificate_authority(&pca_client, &config.ca_common_name()).await?;
    match ca {
        Some((arn, state)) => info!(arn = arn.as_str(), state = state.as_str(), "private CA"),
        None => info!("private CA absent"),
    }

    let acm_client = aws::acm_client(&aws);
    for domain in [
        config.shs.domain.clone(),
        config.vpn_server_domain(),
        config.vpn_client_domain(),
    ] {
        let present =
            aws::resolve::find_certificate_by_domain(&acm_client, &domain).await?.is_some();
        info!(domain = domain.as_str(), present, "certificate");
    }

    let route53_client = aws::route53_client(&aws);
    let zone = aws::resolve::find_hosted_zone(&route53_client, &config.dns.zone).await?;
    info!(zone = config.dns.zone.as_str(), present = zone.is_some(), "hosted zone");

    let ec2_client = aws::ec2_client(&aws);
    let endpoint = vpn::find_endpoint(&ec2_client, config).await?;
    match endpoint {
        Some((id, state)) => info!(id = id.as_str(), state = state.as_str(), "client VPN endpoint"),
        None => info!("client VPN endpoint absent"),
    }

    info!(account = account.as_str(), "status complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("network"), None);
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::ALL.first(), Some(&Stage::Infra));
        assert_eq!(Stage::ALL.last(), Some(&Stage::Vpn));
    }
}
