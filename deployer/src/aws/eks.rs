//! EKS cluster and node group provisioning shared by the EMR and SHS stages

use crate::{aws::POLL_INTERVAL, error::Error, util};
use aws_sdk_eks::{
    types::{AuthenticationMode, CreateAccessConfigRequest, NodegroupScalingConfig, VpcConfigRequest},
    Client,
};
use std::time::Duration;
use tracing::{debug, info};

/// How long to wait for a control plane to come up or go away
const CLUSTER_TIMEOUT: Duration = Duration::from_secs(40 * 60);

/// How long to wait for a node group to come up or go away
const NODEGROUP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Returns the cluster status, or `None` if the cluster does not exist
pub async fn cluster_status(client: &Client, cluster: &str) -> Result<Option<String>, Error> {
    match client.describe_cluster().name(cluster).send().await {
        Ok(resp) => Ok(resp
            .cluster()
            .and_then(|c| c.status())
            .map(|s| s.as_str().to_string())),
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err.is_resource_not_found_exception() {
                Ok(None)
            } else {
                Err(Error::AwsEks {
                    cluster: cluster.to_string(),
                    operation: "DescribeCluster",
                    source: Box::new(aws_sdk_eks::Error::from(service_err)),
                })
            }
        }
    }
}

/// Creates the cluster if absent and waits until it is ACTIVE
pub async fn ensure_cluster(
    client: &Client,
    cluster: &str,
    version: &str,
    role_arn: &str,
    subnet_ids: &[String],
) -> Result<(), Error> {
    match cluster_status(client, cluster).await? {
        Some(status) if status == "ACTIVE" => {
            info!(cluster, "cluster already active");
            return Ok(());
        }
        Some(status) => {
            info!(cluster, status = status.as_str(), "cluster exists, waiting");
        }
        None => {
            info!(cluster, version, "creating cluster");
            client
                .create_cluster()
                .name(cluster)
                .version(version)
                .role_arn(role_arn)
                .resources_vpc_config(
                    VpcConfigRequest::builder()
                        .set_subnet_ids(Some(subnet_ids.to_vec()))
                        .build(),
                )
                .access_config(
                    CreateAccessConfigRequest::builder()
                        .authentication_mode(AuthenticationMode::ApiAndConfigMap)
                        .build(),
                )
                .send()
                .await
                .map_err(|e| Error::AwsEks {
                    cluster: cluster.to_string(),
                    operation: "CreateCluster",
                    source: Box::new(aws_sdk_eks::Error::from(e.into_service_error())),
                })?;
        }
    }
    wait_cluster_active(client, cluster).await
}

async fn wait_cluster_active(client: &Client, cluster: &str) -> Result<(), Error> {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > CLUSTER_TIMEOUT {
            return Err(Error::WaitTimeout {
                what: format!("cluster {cluster} to become active"),
            });
        }
        match cluster_status(client, cluster).await? {
            Some(status) if status == "ACTIVE" => {
                info!(
                    cluster,
                    elapsed_secs = start.elapsed().as_secs(),
                    "cluster active"
                );
                return Ok(());
            }
            Some(status) if status == "FAILED" => {
                return Err(Error::ResourceNotFound {
                    what: format!("healthy cluster {cluster} (creation failed)"),
                });
            }
            Some(status) => {
                debug!(cluster, status = status.as_str(), "cluster not ready");
            }
            None => {
                return Err(Error::ResourceNotFound {
                    what: format!("cluster {cluster} while waiting for it"),
                });
            }
        }
    }
}

/// OIDC issuer URL of the cluster, without the scheme
pub async fn oidc_issuer(client: &Client, cluster: &str) -> Result<String, Error> {
    let resp = client
        .describe_cluster()
        .name(cluster)
        .send()
        .await
        .map_err(|e| Error::AwsEks {
            cluster: cluster.to_string(),
            operation: "DescribeCluster",
            source: Box::new(aws_sdk_eks::Error::from(e.into_service_error())),
        })?;
    let issuer = resp
        .cluster()
        .and_then(|c| c.identity())
        .and_then(|i| i.oidc())
        .and_then(|o| o.issuer())
        .ok_or(Error::ResourceNotFound {
            what: format!("OIDC issuer of cluster {cluster}"),
        })?;
    Ok(issuer.trim_start_matches("https://").to_string())
}

/// Returns the node group status, or `None` if it does not exist
pub async fn nodegroup_status(
    client: &Client,
    cluster: &str,
    nodegroup: &str,
) -> Result<Option<String>, Error> {
    match client
        .describe_nodegroup()
        .cluster_name(cluster)
        .nodegroup_name(nodegroup)
        .send()
        .await
    {
        Ok(resp) => Ok(resp
            .nodegroup()
            .and_then(|n| n.status())
            .map(|s| s.as_str().to_string())),
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err.is_resource_not_found_exception() {
                Ok(None)
            } else {
                Err(Error::AwsEks {
                    cluster: cluster.to_string(),
                    operation: "DescribeNodegroup",
                    source: Box::new(aws_sdk_eks::Error::from(service_err)),
                })
            }
        }
    }
}

/// Creates the managed node group if absent and waits until it is ACTIVE
pub async fn ensure_nodegroup(
    client: &Client,
    cluster: &str,
    nodegroup: &str,
    node_role_arn: &str,
    subnet_ids: &[String],
    instance_type: &str,
    nodes: i32,
) -> Result<(), Error> {
    match nodegroup_status(client, cluster, nodegroup).await? {
        Some(status) if status == "ACTIVE" => {
            info!(cluster, nodegroup, "node group already active");
            return Ok(());
        }
        Some(status) => {
            info!(
                cluster,
                nodegroup,
                status = status.as_str(),
                "node group exists, waiting"
            );
        }
        None => {
            info!(cluster, nodegroup, instance_type, nodes, "creating node group");
            client
                .create_nodegroup()
                .cluster_name(cluster)
                .nodegroup_name(nodegroup)
                .node_role(node_role_arn)
                .set_subnets(Some(subnet_ids.to_vec()))
                .instance_types(instance_type)
                .scaling_config(
                    NodegroupScalingConfig::builder()
                        .min_size(nodes)
                        .max_size(nodes)
                        .desired_size(nodes)
                        .build(),
                )
                .send()
                .await
                .map_err(|e| Error::AwsEks {
                    cluster: cluster.to_string(),
                    operation: "CreateNodegroup",
                    source: Box::new(aws_sdk_eks::Error::from(e.into_service_error())),
                })?;
        }
    }

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > NODEGROUP_TIMEOUT {
            return Err(Error::WaitTimeout {
                what: format!("node group {nodegroup} to become active"),
            });
        }
        match nodegroup_status(client, cluster, nodegroup).await? {
            Some(status) if status == "ACTIVE" => {
                info!(cluster, nodegroup, "node group active");
                return Ok(());
            }
            Some(status) if status.contains("FAILED") || status == "DEGRADED" => {
                return Err(Error::ResourceNotFound {
                    what: format!("healthy node group {nodegroup} (status {status})"),
                });
            }
            Some(status) => {
                debug!(cluster, nodegroup, status = status.as_str(), "node group not ready");
            }
            None => {
                return Err(Error::ResourceNotFound {
                    what: format!("node group {nodegroup} while waiting for it"),
                });
            }
        }
    }
}

/// Grants a principal access to the cluster under a Kubernetes username.
/// An entry that already exists is a no-op.
pub async fn ensure_access_entry(
    client: &Client,
    cluster: &str,
    principal_arn: &str,
    username: &str,
) -> Result<(), Error> {
    let result = client
        .create_access_entry()
        .cluster_name(cluster)
        .principal_arn(principal_arn)
        .username(username)
        .send()
        .await;
    match result {
        Ok(_) => {
            info!(cluster, principal_arn, username, "created access entry");
            Ok(())
        }
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err.is_resource_in_use_exception() {
                debug!(cluster, principal_arn, "access entry already exists");
                Ok(())
            } else {
                Err(Error::AwsEks {
                    cluster: cluster.to_string(),
                    operation: "CreateAccessEntry",
                    source: Box::new(aws_sdk_eks::Error::from(service_err)),
                })
            }
        }
    }
}

/// Deletes the node group if present and waits for it to disappear
pub async fn delete_nodegroup_if_exists(
    client: &Client,
    cluster: &str,
    nodegroup: &str,
) -> Result<(), Error> {
    if nodegroup_status(client, cluster, nodegroup).await?.is_none() {
        info!(cluster, nodegroup, "node group does not exist, nothing to delete");
        return Ok(());
    }
    info!(cluster, nodegroup, "deleting node group");
    client
        .delete_nodegroup()
        .cluster_name(cluster)
        .nodegroup_name(nodegroup)
        .send()
        .await
        .map_err(|e| Error::AwsEks {
            cluster: cluster.to_string(),
            operation: "DeleteNodegroup",
            source: Box::new(aws_sdk_eks::Error::from(e.into_service_error())),
        })?;

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > NODEGROUP_TIMEOUT {
            return Err(Error::WaitTimeout {
                what: format!("node group {nodegroup} to be deleted"),
            });
        }
        match nodegroup_status(client, cluster, nodegroup).await? {
            None => {
                info!(cluster, nodegroup, "node group deleted");
                return Ok(());
            }
            Some(status) => {
                debug!(cluster, nodegroup, status = status.as_str(), "node group deleting");
            }
        }
    }
}

/// Deletes the cluster if present and waits for it to disappear
pub async fn delete_cluster_if_exists(client: &Client, cluster: &str) -> Result<(), Error> {
    if cluster_status(client, cluster).await?.is_none() {
        info!(cluster, "cluster does not exist, nothing to delete");
        return Ok(());
    }
    info!(cluster, "deleting cluster");
    client
        .delete_cluster()
        .name(cluster)
        .send()
        .await
        .map_err(|e| Error::AwsEks {
            cluster: cluster.to_string(),
            operation: "DeleteCluster",
            source: Box::new(aws_sdk_eks::Error::from(e.into_service_error())),
        })?;

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > CLUSTER_TIMEOUT {
            return Err(Error::WaitTimeout {
                what: format!("cluster {cluster} to be deleted"),
            });
        }
        match cluster_status(client, cluster).await? {
            None => {
                info!(cluster, "cluster deleted");
                return Ok(());
            }
            Some(status) => {
                debug!(cluster, status = status.as_str(), "cluster deleting");
            }
        }
    }
}

/// Registers the cluster in the local kubeconfig so helm and kubectl can
/// reach it
pub async fn update_kubeconfig(region: &str, cluster: &str) -> Result<(), Error> {
    util::run(
        "aws",
        &[
            "eks",
            "update-kubeconfig",
            "--region",
            region,
            "--name",
            cluster,
            "--alias",
            cluster,
        ],
    )
    .await?;
    debug!(cluster, "kubeconfig updated");
    Ok(())
}
