//! SSL stage: root Private CA, history-server certificate, and the
//! private hosted zone

use crate::{
    aws::{acm, cloudformation, pca, route53},
    config::Config,
    error::Error,
};
use aws_config::SdkConfig;
use tracing::info;

pub async fn deploy(config: &Config, aws: &SdkConfig, _account: &str) -> Result<(), Error> {
    let pca_client = crate::aws::pca_client(aws);
    let ca_arn = pca::ensure_root_ca(&pca_client, &config.ca_common_name(), &config.name).await?;

    let acm_client = crate::aws::acm_client(aws);
    let certificate_arn =
        acm::ensure_private_certificate(&acm_client, &config.shs.domain, &ca_arn).await?;
    info!(
        domain = config.shs.domain.as_str(),
        arn = certificate_arn.as_str(),
        "history-server certificate ready"
    );

    // The zone is private and only resolvable from inside the platform VPC
    let cfn = crate::aws::cloudformation_client(aws);
    let stack = config.network_stack();
    let outputs = cloudformation::stack_outputs(&cfn, &stack).await?;
    let vpc_id = cloudformation::require_output(&outputs, &stack, "VpcId")?;

    let route53_client = crate::aws::route53_client(aws);
    let zone_id = route53::ensure_private_zone(
        &route53_client,
        &config.dns.zone,
        &vpc_id,
        &config.region,
    )
    .await?;
    info!(
        zone = config.dns.zone.as_str(),
        id = zone_id.as_str(),
        "private hosted zone ready"
    );
    Ok(())
}

pub async fn destroy(config: &Config, aws: &SdkConfig, _account: &str) -> Result<(), Error> {
    let acm_client = crate::aws::acm_client(aws);
    acm::delete_certificate_if_exists(&acm_client, &config.shs.domain).await?;

    let pca_client = crate::aws::pca_client(aws);
    pca::disable_and_delete_ca(&pca_client, &config.ca_common_name()).await?;

    let route53_client = crate::aws::route53_client(aws);
    route53::delete_zone_if_exists(&route53_client, &config.dns.zone).await?;
    Ok(())
}
