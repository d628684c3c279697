//! Lookups of pre-existing resources by tag, name, or domain
//!
//! Every lookup filters server-side where the API allows it, then requires
//! exactly one match: an empty result fails fast and an ambiguous one is
//! reported with its candidates instead of silently picking the first.

use crate::error::Error;
use aws_sdk_ec2::types::Filter;
use tracing::debug;

/// Summary of a resolved load balancer
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    pub arn: String,
    pub name: String,
    pub dns_name: String,
    pub hosted_zone_id: String,
    pub state: String,
}

/// Requires exactly one candidate, failing with names otherwise
pub fn select_unique<T>(
    mut candidates: Vec<T>,
    what: &str,
    label: impl Fn(&T) -> String,
) -> Result<T, Error> {
    match candidates.len() {
        0 => Err(Error::ResourceNotFound {
            what: what.to_string(),
        }),
        1 => Ok(candidates.remove(0)),
        _ => Err(Error::AmbiguousResource {
            what: what.to_string(),
            candidates: candidates.iter().map(label).collect(),
        }),
    }
}

/// Strips the trailing dot Route 53 appends to zone and record names
pub fn normalize_dns_name(name: &str) -> &str {
    name.trim_end_matches('.')
}

/// Finds the VPC carrying the given `Name` tag
pub async fn find_vpc_by_name(
    client: &aws_sdk_ec2::Client,
    name: &str,
) -> Result<String, Error> {
    let resp = client
        .describe_vpcs()
        .filters(Filter::builder().name("tag:Name").values(name).build())
        .send()
        .await
        .map_err(|e| Error::AwsEc2 {
            operation: "DescribeVpcs",
            source: Box::new(aws_sdk_ec2::Error::from(e.into_service_error())),
        })?;
    let ids: Vec<String> = resp
        .vpcs()
        .iter()
        .filter_map(|vpc| vpc.vpc_id().map(str::to_string))
        .collect();
    select_unique(ids, &format!("VPC tagged Name={name}"), Clone::clone)
}

/// Finds subnets in a VPC whose `Name` tag matches a wildcard pattern,
/// e.g. `*-private-*`
pub async fn find_subnets_by_name(
    client: &aws_sdk_ec2::Client,
    vpc_id: &str,
    name_pattern: &str,
) -> Result<Vec<String>, Error> {
    let resp = client
        .describe_subnets()
        .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
        .filters(
            Filter::builder()
                .name("tag:Name")
                .values(name_pattern)
                .build(),
        )
        .send()
        .await
        .map_err(|e| Error::AwsEc2 {
            operation: "DescribeSubnets",
            source: Box::new(aws_sdk_ec2::Error::from(e.into_service_error())),
        })?;
    let mut ids: Vec<String> = resp
        .subnets()
        .iter()
        .filter_map(|subnet| subnet.subnet_id().map(str::to_string))
        .collect();
    ids.sort();
    if ids.is_empty() {
        return Err(Error::ResourceNotFound {
            what: format!("subnets tagged Name={name_pattern} in {vpc_id}"),
        });
    }
    Ok(ids)
}

/// Finds the load balancer whose name starts with the given prefix.
///
/// Kubernetes ingress controllers name ALBs `k8s-<namespace>-...`, so the
/// prefix is the only stable handle the deployer has.
pub async fn find_load_balancer_by_prefix(
    client: &aws_sdk_elasticloadbalancingv2::Client,
    prefix: &str,
) -> Result<LoadBalancer, Error> {
    let mut marker: Option<String> = None;
    let mut matches = Vec::new();
    loop {
        let mut request = client.describe_load_balancers();
        if let Some(m) = marker.take() {
            request = request.marker(m);
        }
        let resp = request.send().await.map_err(|e| Error::AwsElb {
            operation: "DescribeLoadBalancers",
            source: Box::new(aws_sdk_elasticloadbalancingv2::Error::from(
                e.into_service_error(),
            )),
        })?;
        for lb in resp.load_balancers() {
            let Some(name) = lb.load_balancer_name() else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            matches.push(LoadBalancer {
                arn: lb.load_balancer_arn().unwrap_or_default().to_string(),
                name: name.to_string(),
                dns_name: lb.dns_name().unwrap_or_default().to_string(),
                hosted_zone_id: lb.canonical_hosted_zone_id().unwrap_or_default().to_string(),
                state: lb
                    .state()
                    .and_then(|s| s.code())
                    .map(|c| c.as_str().to_string())
                    .unwrap_or_default(),
            });
        }
        match resp.next_marker() {
            Some(next) => marker = Some(next.to_string()),
            None => break,
        }
    }
    select_unique(
        matches,
        &format!("load balancer named {prefix}*"),
        |lb| lb.name.clone(),
    )
}

/// Finds an ACM certificate by exact domain name, if any
pub async fn find_certificate_by_domain(
    client: &aws_sdk_acm::Client,
    domain: &str,
) -> Result<Option<String>, Error> {
    let mut token: Option<String> = None;
    loop {
        let mut request = client.list_certificates();
        if let Some(t) = token.take() {
            request = request.next_token(t);
        }
        let resp = request.send().await.map_err(|e| Error::AwsAcm {
            operation: "ListCertificates",
            source: Box::new(aws_sdk_acm::Error::from(e.into_service_error())),
        })?;
        for summary in resp.certificate_summary_list() {
            if summary.domain_name() == Some(domain) {
                debug!(domain, "found existing certificate");
                return Ok(summary.certificate_arn().map(str::to_string));
            }
        }
        match resp.next_token() {
            Some(next) => token = Some(next.to_string()),
            None => return Ok(None),
        }
    }
}

/// Finds a hosted zone by name, if any, returning its id
pub async fn find_hosted_zone(
    client: &aws_sdk_route53::Client,
    zone: &str,
) -> Result<Option<String>, Error> {
    let resp = client
        .list_hosted_zones_by_name()
        .dns_name(zone)
        .send()
        .await
        .map_err(|e| Error::AwsRoute53 {
            operation: "ListHostedZonesByName",
            source: Box::new(aws_sdk_route53::Error::from(e.into_service_error())),
        })?;
    for hosted_zone in resp.hosted_zones() {
        if normalize_dns_name(hosted_zone.name()) == normalize_dns_name(zone) {
            return Ok(Some(hosted_zone.id().to_string()));
        }
    }
    Ok(None)
}

/// Finds a non-deleted private CA by subject common name, if any
pub async fn find_certificate_authority(
    client: &aws_sdk_acmpca::Client,
    common_name: &str,
) -> Result<Option<(String, String)>, Error> {
    let mut token: Option<String> = None;
    loop {
        let mut request = client.list_certificate_authorities();
        if let Some(t) = token.take() {
            request = request.next_token(t);
        }
        let resp = request.send().await.map_err(|e| Error::AwsAcmPca {
            operation: "ListCertificateAuthorities",
            source: Box::new(aws_sdk_acmpca::Error::from(e.into_service_error())),
        })?;
        for ca in resp.certificate_authorities() {
            let subject_matches = ca
                .certificate_authority_configuration()
                .and_then(|c| c.subject())
                .and_then(|s| s.common_name())
                == Some(common_name);
            let status = ca
                .status()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default();
            if subject_matches && status != "DELETED" {
                if let Some(arn) = ca.arn() {
                    return Ok(Some((arn.to_string(), status)));
                }
            }
        }
        match resp.next_token() {
            Some(next) => token = Some(next.to_string()),
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_unique_single() {
        let picked = select_unique(vec!["vpc-1".to_string()], "VPC", Clone::clone).unwrap();
        assert_eq!(picked, "vpc-1");
    }

    #[test]
    fn test_select_unique_empty_is_not_found() {
        let err = select_unique(Vec::<String>::new(), "VPC tagged Name=demo", Clone::clone)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ResourceNotFound { what } if what == "VPC tagged Name=demo"
        ));
    }

    #[test]
    fn test_select_unique_many_is_ambiguous() {
        let err = select_unique(
            vec!["vpc-1".to_string(), "vpc-2".to_string()],
            "VPC",
            Clone::clone,
        )
        .unwrap_err();
        match err {
            Error::AmbiguousResource { candidates, .. } => {
                assert_eq!(candidates, vec!["vpc-1", "vpc-2"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_normalize_dns_name() {
        assert_eq!(normalize_dns_name("observability.internal."), "observability.internal");
        assert_eq!(normalize_dns_name("observability.internal"), "observability.internal");
    }
}
