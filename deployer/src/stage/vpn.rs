//! VPN stage: mutual-TLS Client VPN endpoint and the DNS alias that makes
//! the history server reachable from connected clients

use crate::{
    aws::{acm, cloudformation, resolve, route53, POLL_INTERVAL},
    config::Config,
    error::Error,
    templates, util,
};
use aws_config::SdkConfig;
use aws_sdk_ec2::types::{
    CertificateAuthenticationRequest, ClientVpnAuthenticationRequest,
    ClientVpnAuthenticationType, ConnectionLogOptions, Filter, ResourceType, Tag,
    TagSpecification,
};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// How long to wait for endpoint and association state changes
const VPN_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Prefix used for the ALB alias the SHS stage provisions
const ALB_PREFIX: &str = "k8s-shs";

/// Finds the Client VPN endpoint tagged with the deployment name
pub async fn find_endpoint(
    client: &aws_sdk_ec2::Client,
    config: &Config,
) -> Result<Option<(String, String)>, Error> {
    let resp = client
        .describe_client_vpn_endpoints()
        .filters(
            Filter::builder()
                .name("tag:Name")
                .values(config.vpn_endpoint_name())
                .build(),
        )
        .send()
        .await
        .map_err(|e| Error::AwsEc2 {
            operation: "DescribeClientVpnEndpoints",
            source: Box::new(aws_sdk_ec2::Error::from(e.into_service_error())),
        })?;
    for endpoint in resp.client_vpn_endpoints() {
        if let Some(id) = endpoint.client_vpn_endpoint_id() {
            let state = endpoint
                .status()
                .and_then(|s| s.code())
                .map(|c| c.as_str().to_string())
                .unwrap_or_default();
            return Ok(Some((id.to_string(), state)));
        }
    }
    Ok(None)
}

/// Target networks of the endpoint that are not yet disassociated, as
/// (association id, subnet id, state) triples
async fn associated_subnets(
    client: &aws_sdk_ec2::Client,
    endpoint_id: &str,
) -> Result<Vec<(String, String, String)>, Error> {
    let resp = client
        .describe_client_vpn_target_networks()
        .client_vpn_endpoint_id(endpoint_id)
        .send()
        .await
        .map_err(|e| Error::AwsEc2 {
            operation: "DescribeClientVpnTargetNetworks",
            source: Box::new(aws_sdk_ec2::Error::from(e.into_service_error())),
        })?;
    let mut associations = Vec::new();
    for network in resp.client_vpn_target_networks() {
        let state = network
            .status()
            .and_then(|s| s.code())
            .map(|c| c.as_str().to_string())
            .unwrap_or_default();
        if state == "disassociated" {
            continue;
        }
        if let (Some(association), Some(subnet)) =
            (network.association_id(), network.target_network_id())
        {
            associations.push((association.to_string(), subnet.to_string(), state));
        }
    }
    Ok(associations)
}

/// Creates the endpoint if absent and returns its id
async fn ensure_endpoint(
    client: &aws_sdk_ec2::Client,
    config: &Config,
    vpc_id: &str,
    server_certificate_arn: &str,
    client_certificate_arn: &str,
) -> Result<String, Error> {
    if let Some((id, state)) = find_endpoint(client, config).await? {
        info!(id = id.as_str(), state = state.as_str(), "VPN endpoint already exists");
        return Ok(id);
    }

    info!("creating client VPN endpoint");
    let (tag_key, tag_value) = config.deployment_tag();
    let resp = client
        .create_client_vpn_endpoint()
        .client_cidr_block(&config.vpn.client_cidr)
        .server_certificate_arn(server_certificate_arn)
        .authentication_options(
            ClientVpnAuthenticationRequest::builder()
                .r#type(ClientVpnAuthenticationType::CertificateAuthentication)
                .mutual_authentication(
                    CertificateAuthenticationRequest::builder()
                        .client_root_certificate_chain_arn(client_certificate_arn)
                        .build(),
                )
                .build(),
        )
        .connection_log_options(ConnectionLogOptions::builder().enabled(false).build())
        .vpc_id(vpc_id)
        .split_tunnel(true)
        .description(format!("{} platform access", config.name))
        .tag_specifications(
            TagSpecification::builder()
                .resource_type(ResourceType::ClientVpnEndpoint)
                .tags(
                    Tag::builder()
                        .key("Name")
                        .value(config.vpn_endpoint_name())
                        .build(),
                )
                .tags(Tag::builder().key(tag_key).value(tag_value).build())
                .build(),
        )
        .send()
        .await
        .map_err(|e| Error::AwsEc2 {
            operation: "CreateClientVpnEndpoint",
            source: Box::new(aws_sdk_ec2::Error::from(e.into_service_error())),
        })?;
    resp.client_vpn_endpoint_id()
        .map(str::to_string)
        .ok_or(Error::ResourceNotFound {
            what: "created client VPN endpoint id".to_string(),
        })
}

/// Waits for the endpoint to report the given state
async fn wait_endpoint_state(
    client: &aws_sdk_ec2::Client,
    config: &Config,
    expected: &str,
) -> Result<(), Error> {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > VPN_TIMEOUT {
            return Err(Error::WaitTimeout {
                what: format!("client VPN endpoint to become {expected}"),
            });
        }
        match find_endpoint(client, config).await? {
            Some((_, state)) if state == expected => return Ok(()),
            Some((id, state)) => {
                debug!(id = id.as_str(), state = state.as_str(), "VPN endpoint not ready");
            }
            None => {
                return Err(Error::ResourceNotFound {
                    what: "client VPN endpoint while waiting for it".to_string(),
                });
            }
        }
    }
}

pub async fn deploy(config: &Config, aws: &SdkConfig, _account: &str) -> Result<(), Error> {
    let ec2_client = crate::aws::ec2_client(aws);
    let vpc_id = resolve::find_vpc_by_name(&ec2_client, &config.vpc_name()).await?;
    let subnets = resolve::find_subnets_by_name(
        &ec2_client,
        &vpc_id,
        &format!("{}-private-*", config.vpc_name()),
    )
    .await?;

    let pca_client = crate::aws::pca_client(aws);
    let ca = resolve::find_certificate_authority(&pca_client, &config.ca_common_name())
        .await?
        .ok_or(Error::ResourceNotFound {
            what: format!(
                "certificate authority {} (deploy the ssl stage first)",
                config.ca_common_name()
            ),
        })?;
    let ca_arn = ca.0;

    // Server and client certificates are independent; wait on both at once
    let acm_client = crate::aws::acm_client(aws);
    let (server_certificate, client_certificate) = futures::try_join!(
        acm::ensure_private_certificate(&acm_client, &config.vpn_server_domain(), &ca_arn),
        acm::ensure_private_certificate(&acm_client, &config.vpn_client_domain(), &ca_arn),
    )?;

    let endpoint_id = ensure_endpoint(
        &ec2_client,
        config,
        &vpc_id,
        &server_certificate,
        &client_certificate,
    )
    .await?;

    // Associate the first private subnet unless it already is
    let associated = associated_subnets(&ec2_client, &endpoint_id).await?;
    let target_subnet = &subnets[0];
    if !associated.iter().any(|(_, subnet, _)| subnet == target_subnet) {
        info!(subnet = target_subnet.as_str(), "associating target network");
        ec2_client
            .associate_client_vpn_target_network()
            .client_vpn_endpoint_id(&endpoint_id)
            .subnet_id(target_subnet)
            .send()
            .await
            .map_err(|e| Error::AwsEc2 {
                operation: "AssociateClientVpnTargetNetwork",
                source: Box::new(aws_sdk_ec2::Error::from(e.into_service_error())),
            })?;
    }

    // Authorize VPN clients into the VPC
    let stack = config.network_stack();
    let cfn = crate::aws::cloudformation_client(aws);
    let outputs = cloudformation::stack_outputs(&cfn, &stack).await?;
    let vpc_cidr = cloudformation::require_output(&outputs, &stack, "VpcCidr")?;
    let rules = ec2_client
        .describe_client_vpn_authorization_rules()
        .client_vpn_endpoint_id(&endpoint_id)
        .send()
        .await
        .map_err(|e| Error::AwsEc2 {
            operation: "DescribeClientVpnAuthorizationRules",
            source: Box::new(aws_sdk_ec2::Error::from(e.into_service_error())),
        })?;
    let authorized = rules
        .authorization_rules()
        .iter()
        .any(|rule| rule.destination_cidr() == Some(vpc_cidr.as_str()));
    if !authorized {
        info!(cidr = vpc_cidr.as_str(), "authorizing VPN ingress");
        ec2_client
            .authorize_client_vpn_ingress()
            .client_vpn_endpoint_id(&endpoint_id)
            .target_network_cidr(&vpc_cidr)
            .authorize_all_groups(true)
            .description("platform VPC access")
            .send()
            .await
            .map_err(|e| Error::AwsEc2 {
                operation: "AuthorizeClientVpnIngress",
                source: Box::new(aws_sdk_ec2::Error::from(e.into_service_error())),
            })?;
    }
    wait_endpoint_state(&ec2_client, config, "available").await?;

    // Build the connection profile: exported base config plus the client
    // certificate and its passphrase-protected key
    let exported = ec2_client
        .export_client_vpn_client_configuration()
        .client_vpn_endpoint_id(&endpoint_id)
        .send()
        .await
        .map_err(|e| Error::AwsEc2 {
            operation: "ExportClientVpnClientConfiguration",
            source: Box::new(aws_sdk_ec2::Error::from(e.into_service_error())),
        })?;
    let profile = exported
        .client_configuration()
        .ok_or(Error::ResourceNotFound {
            what: "exported client VPN configuration".to_string(),
        })?;

    let passphrase = Uuid::new_v4().simple().to_string();
    let material =
        acm::export_certificate(&acm_client, &client_certificate, &passphrase).await?;
    let workspace = util::workspace_directory(Some(&config.name));
    let passphrase_file = format!("{}-vpn-passphrase.txt", config.name);
    util::write_artifact(&workspace, &passphrase_file, &passphrase)?;
    util::write_artifact(
        &workspace,
        &format!("{}.ovpn", config.name),
        &templates::splice_vpn_profile(
            profile,
            &material.certificate,
            &material.private_key,
            &passphrase_file,
        ),
    )?;

    // Point the history-server domain at the internal ALB
    let route53_client = crate::aws::route53_client(aws);
    let zone_id = resolve::find_hosted_zone(&route53_client, &config.dns.zone)
        .await?
        .ok_or(Error::ResourceNotFound {
            what: format!("hosted zone {} (deploy the ssl stage first)", config.dns.zone),
        })?;
    let elb_client = crate::aws::elb_client(aws);
    let lb = resolve::find_load_balancer_by_prefix(&elb_client, ALB_PREFIX).await?;
    route53::upsert_alias(
        &route53_client,
        &zone_id,
        &config.shs.domain,
        &lb.dns_name,
        &lb.hosted_zone_id,
    )
    .await?;
    info!(
        domain = config.shs.domain.as_str(),
        "VPN profile written; connect and browse the history server"
    );
    Ok(())
}

pub async fn destroy(config: &Config, aws: &SdkConfig, _account: &str) -> Result<(), Error> {
    // DNS alias first, while the zone may still exist
    let route53_client = crate::aws::route53_client(aws);
    if let Some(zone_id) = resolve::find_hosted_zone(&route53_client, &config.dns.zone).await? {
        route53::delete_record_if_exists(&route53_client, &zone_id, &config.shs.domain).await?;
    } else {
        info!(zone = config.dns.zone.as_str(), "hosted zone does not exist, no record to delete");
    }

    let ec2_client = crate::aws::ec2_client(aws);
    match find_endpoint(&ec2_client, config).await? {
        Some((endpoint_id, _)) => {
            for (association_id, subnet, state) in
                associated_subnets(&ec2_client, &endpoint_id).await?
            {
                if state == "disassociating" {
                    continue;
                }
                info!(subnet = subnet.as_str(), "disassociating target network");
                ec2_client
                    .disassociate_client_vpn_target_network()
                    .client_vpn_endpoint_id(&endpoint_id)
                    .association_id(&association_id)
                    .send()
                    .await
                    .map_err(|e| Error::AwsEc2 {
                        operation: "DisassociateClientVpnTargetNetwork",
                        source: Box::new(aws_sdk_ec2::Error::from(e.into_service_error())),
                    })?;
            }

            // Associations must drain before the endpoint can be deleted
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            let start = std::time::Instant::now();
            loop {
                interval.tick().await;
                if start.elapsed() > VPN_TIMEOUT {
                    return Err(Error::WaitTimeout {
                        what: "client VPN target networks to disassociate".to_string(),
                    });
                }
                if associated_subnets(&ec2_client, &endpoint_id).await?.is_empty() {
                    break;
                }
                debug!("target networks still associated");
            }

            ec2_client
                .delete_client_vpn_endpoint()
                .client_vpn_endpoint_id(&endpoint_id)
                .send()
                .await
                .map_err(|e| Error::AwsEc2 {
                    operation: "DeleteClientVpnEndpoint",
                    source: Box::new(aws_sdk_ec2::Error::from(e.into_service_error())),
                })?;
            info!(id = endpoint_id.as_str(), "deleted client VPN endpoint");
        }
        None => {
            info!("client VPN endpoint does not exist, nothing to delete");
        }
    }

    let acm_client = crate::aws::acm_client(aws);
    acm::delete_certificate_if_exists(&acm_client, &config.vpn_server_domain()).await?;
    acm::delete_certificate_if_exists(&acm_client, &config.vpn_client_domain()).await?;
    Ok(())
}
