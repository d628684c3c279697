//! Private hosted zone and alias record management

use crate::{aws::resolve, error::Error};
use aws_sdk_route53::{
    types::{
        AliasTarget, Change, ChangeAction, ChangeBatch, HostedZoneConfig, ResourceRecordSet,
        RrType, Vpc, VpcRegion,
    },
    Client,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Finds or creates the private hosted zone associated with the VPC,
/// returning its id
pub async fn ensure_private_zone(
    client: &Client,
    zone: &str,
    vpc_id: &str,
    region: &str,
) -> Result<String, Error> {
    if let Some(id) = resolve::find_hosted_zone(client, zone).await? {
        info!(zone, id = id.as_str(), "hosted zone already exists");
        return Ok(id);
    }

    info!(zone, vpc_id, "creating private hosted zone");
    client
        .create_hosted_zone()
        .name(zone)
        .caller_reference(Uuid::new_v4().to_string())
        .vpc(
            Vpc::builder()
                .vpc_region(VpcRegion::from(region))
                .vpc_id(vpc_id)
                .build(),
        )
        .hosted_zone_config(HostedZoneConfig::builder().private_zone(true).build())
        .send()
        .await
        .map_err(|e| Error::AwsRoute53 {
            operation: "CreateHostedZone",
            source: Box::new(aws_sdk_route53::Error::from(e.into_service_error())),
        })?;

    resolve::find_hosted_zone(client, zone)
        .await?
        .ok_or(Error::ResourceNotFound {
            what: format!("hosted zone {zone} after creating it"),
        })
}

/// Upserts an A alias record pointing at a load balancer
pub async fn upsert_alias(
    client: &Client,
    zone_id: &str,
    record: &str,
    target_dns: &str,
    target_zone_id: &str,
) -> Result<(), Error> {
    let alias = AliasTarget::builder()
        .hosted_zone_id(target_zone_id)
        .dns_name(target_dns)
        .evaluate_target_health(false)
        .build()?;
    let record_set = ResourceRecordSet::builder()
        .name(record)
        .r#type(RrType::A)
        .alias_target(alias)
        .build()?;
    client
        .change_resource_record_sets()
        .hosted_zone_id(zone_id)
        .change_batch(
            ChangeBatch::builder()
                .changes(
                    Change::builder()
                        .action(ChangeAction::Upsert)
                        .resource_record_set(record_set)
                        .build()?,
                )
                .build()?,
        )
        .send()
        .await
        .map_err(|e| Error::AwsRoute53 {
            operation: "ChangeResourceRecordSets",
            source: Box::new(aws_sdk_route53::Error::from(e.into_service_error())),
        })?;
    info!(record, target_dns, "upserted alias record");
    Ok(())
}

/// Deletes the A record with the given name if it exists
pub async fn delete_record_if_exists(
    client: &Client,
    zone_id: &str,
    record: &str,
) -> Result<(), Error> {
    let resp = client
        .list_resource_record_sets()
        .hosted_zone_id(zone_id)
        .start_record_name(record)
        .start_record_type(RrType::A)
        .send()
        .await
        .map_err(|e| Error::AwsRoute53 {
            operation: "ListResourceRecordSets",
            source: Box::new(aws_sdk_route53::Error::from(e.into_service_error())),
        })?;
    let target = resp.resource_record_sets().iter().find(|rrs| {
        resolve::normalize_dns_name(rrs.name()) == resolve::normalize_dns_name(record)
            && rrs.r#type().as_str() == "A"
    });
    let Some(record_set) = target else {
        info!(record, "record does not exist, nothing to delete");
        return Ok(());
    };
    client
        .change_resource_record_sets()
        .hosted_zone_id(zone_id)
        .change_batch(
            ChangeBatch::builder()
                .changes(
                    Change::builder()
                        .action(ChangeAction::Delete)
                        .resource_record_set(record_set.clone())
                        .build()?,
                )
                .build()?,
        )
        .send()
        .await
        .map_err(|e| Error::AwsRoute53 {
            operation: "ChangeResourceRecordSets",
            source: Box::new(aws_sdk_route53::Error::from(e.into_service_error())),
        })?;
    info!(record, "deleted record");
    Ok(())
}

/// Deletes every record in the zone apart from the NS/SOA pair the zone
/// cannot live without
async fn delete_extra_records(client: &Client, zone_id: &str) -> Result<(), Error> {
    let resp = client
        .list_resource_record_sets()
        .hosted_zone_id(zone_id)
        .send()
        .await
        .map_err(|e| Error::AwsRoute53 {
            operation: "ListResourceRecordSets",
            source: Box::new(aws_sdk_route53::Error::from(e.into_service_error())),
        })?;
    for record_set in resp.resource_record_sets() {
        let kind = record_set.r#type().as_str();
        if kind == "NS" || kind == "SOA" {
            continue;
        }
        debug!(
            record = record_set.name(),
            kind, "deleting leftover record"
        );
        client
            .change_resource_record_sets()
            .hosted_zone_id(zone_id)
            .change_batch(
                ChangeBatch::builder()
                    .changes(
                        Change::builder()
                            .action(ChangeAction::Delete)
                            .resource_record_set(record_set.clone())
                            .build()?,
                    )
                    .build()?,
            )
            .send()
            .await
            .map_err(|e| Error::AwsRoute53 {
                operation: "ChangeResourceRecordSets",
                source: Box::new(aws_sdk_route53::Error::from(e.into_service_error())),
            })?;
    }
    Ok(())
}

/// Deletes the hosted zone and its records; an absent zone is a no-op
pub async fn delete_zone_if_exists(client: &Client, zone: &str) -> Result<(), Error> {
    let Some(id) = resolve::find_hosted_zone(client, zone).await? else {
        info!(zone, "hosted zone does not exist, nothing to delete");
        return Ok(());
    };
    delete_extra_records(client, &id).await?;
    client
        .delete_hosted_zone()
        .id(&id)
        .send()
        .await
        .map_err(|e| Error::AwsRoute53 {
            operation: "DeleteHostedZone",
            source: Box::new(aws_sdk_route53::Error::from(e.into_service_error())),
        })?;
    info!(zone, id = id.as_str(), "deleted hosted zone");
    Ok(())
}
