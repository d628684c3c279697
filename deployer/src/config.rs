//! Deployment configuration loaded from a YAML file
//!
//! All resource names are derived from `name`, so two deployments with
//! different names can coexist in one account. Validation runs before any
//! AWS client is constructed; a config that passes `validate` is the only
//! thing the stages ever see.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path};

#[derive(Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    /// CIDR block for the platform VPC
    pub vpc_cidr: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    pub name: String,
    /// Kubernetes version, e.g. "1.31"
    pub version: String,
    pub instance_type: String,
    pub nodes: i32,
    /// Namespace the EMR virtual cluster is mapped onto
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct JobsConfig {
    /// ECR repository name for the custom Spark image
    pub repository: String,
    /// Base image the custom image is built from
    pub base_image: String,
    /// EMR release label used for job submission, e.g. "emr-7.2.0-latest"
    pub release_label: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct DnsConfig {
    /// Private hosted zone name, e.g. "observability.internal"
    pub zone: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ShsConfig {
    /// Name of the EKS cluster hosting the Spark History Server
    pub cluster: String,
    pub version: String,
    pub instance_type: String,
    pub nodes: i32,
    /// Fully-qualified domain the history server is served under; must be
    /// inside `dns.zone`
    pub domain: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct VpnConfig {
    /// CIDR block assigned to VPN clients; must not overlap the VPC CIDR
    pub client_cidr: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
    /// Deployment name, used as a prefix for every AWS resource
    pub name: String,
    pub region: String,
    pub network: NetworkConfig,
    /// Data-plane clusters running EMR-on-EKS workloads
    pub clusters: Vec<ClusterConfig>,
    pub jobs: JobsConfig,
    pub dns: DnsConfig,
    pub shs: ShsConfig,
    pub vpn: VpnConfig,
}

impl Config {
    /// Loads and validates a configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        fn required(field: &str, value: &str) -> Result<(), Error> {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfig(format!("{field} must be set")));
            }
            Ok(())
        }

        required("name", &self.name)?;
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::InvalidConfig(
                "name must be lowercase alphanumeric with dashes".to_string(),
            ));
        }
        required("region", &self.region)?;
        required("network.vpc_cidr", &self.network.vpc_cidr)?;
        if self.clusters.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one data-plane cluster must be configured".to_string(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for cluster in &self.clusters {
            required("clusters[].name", &cluster.name)?;
            required("clusters[].version", &cluster.version)?;
            required("clusters[].instance_type", &cluster.instance_type)?;
            required("clusters[].namespace", &cluster.namespace)?;
            if cluster.nodes < 1 {
                return Err(Error::InvalidConfig(format!(
                    "cluster {} must have at least one node",
                    cluster.name
                )));
            }
            if !names.insert(cluster.name.clone()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate cluster name: {}",
                    cluster.name
                )));
            }
            if cluster.name == self.shs.cluster {
                return Err(Error::InvalidConfig(format!(
                    "cluster name {} collides with shs.cluster",
                    cluster.name
                )));
            }
        }
        required("jobs.repository", &self.jobs.repository)?;
        required("jobs.base_image", &self.jobs.base_image)?;
        required("jobs.release_label", &self.jobs.release_label)?;
        required("dns.zone", &self.dns.zone)?;
        required("shs.cluster", &self.shs.cluster)?;
        required("shs.version", &self.shs.version)?;
        required("shs.instance_type", &self.shs.instance_type)?;
        required("shs.domain", &self.shs.domain)?;
        if self.shs.nodes < 1 {
            return Err(Error::InvalidConfig(
                "shs.nodes must be at least one".to_string(),
            ));
        }
        if !self.shs.domain.ends_with(self.dns.zone.trim_end_matches('.')) {
            return Err(Error::InvalidConfig(format!(
                "shs.domain {} is not inside dns.zone {}",
                self.shs.domain, self.dns.zone
            )));
        }
        required("vpn.client_cidr", &self.vpn.client_cidr)?;
        Ok(())
    }

    /// Name of the CloudFormation network stack
    pub fn network_stack(&self) -> String {
        format!("{}-network", self.name)
    }

    /// Name of the CloudFormation Spark event-log stack
    pub fn logs_stack(&self) -> String {
        format!("{}-logs", self.name)
    }

    /// Bucket holding uploaded CloudFormation templates and job artifacts.
    /// Account and region are part of the name since buckets are global.
    pub fn templates_bucket(&self, account: &str) -> String {
        format!("{}-templates-{}-{}", self.name, account, self.region)
    }

    /// Bucket receiving Spark event logs, created by the logs stack
    pub fn log_bucket(&self, account: &str) -> String {
        format!("{}-spark-logs-{}-{}", self.name, account, self.region)
    }

    /// S3 prefix under which Spark event logs are written
    pub fn log_prefix(&self) -> &'static str {
        "spark-events"
    }

    /// `Name` tag of the platform VPC
    pub fn vpc_name(&self) -> String {
        format!("{}-vpc", self.name)
    }

    /// EKS cluster name for a data-plane cluster
    pub fn eks_cluster(&self, cluster: &str) -> String {
        format!("{}-{}", self.name, cluster)
    }

    /// EMR virtual cluster name for a data-plane cluster
    pub fn virtual_cluster(&self, cluster: &str) -> String {
        format!("{}-{}", self.name, cluster)
    }

    /// IAM role assumed by Spark jobs in a data-plane cluster
    pub fn job_execution_role(&self, cluster: &str) -> String {
        format!("{}-{}-job-execution", self.name, cluster)
    }

    /// IAM role the Spark History Server uses to read event logs
    pub fn shs_role(&self) -> String {
        format!("{}-shs", self.name)
    }

    /// IAM role for the AWS Load Balancer Controller on the SHS cluster
    pub fn alb_controller_role(&self) -> String {
        format!("{}-alb-controller", self.name)
    }

    /// Subject common name of the root Private CA
    pub fn ca_common_name(&self) -> String {
        format!("{}.ca.{}", self.name, self.dns.zone.trim_end_matches('.'))
    }

    /// Domain of the VPN server certificate
    pub fn vpn_server_domain(&self) -> String {
        format!("vpn.{}", self.dns.zone.trim_end_matches('.'))
    }

    /// Domain of the VPN client certificate
    pub fn vpn_client_domain(&self) -> String {
        format!("client.vpn.{}", self.dns.zone.trim_end_matches('.'))
    }

    /// Value of the `Name` tag on the Client VPN endpoint
    pub fn vpn_endpoint_name(&self) -> String {
        format!("{}-vpn", self.name)
    }

    /// Tag applied to every taggable resource the deployer creates
    pub fn deployment_tag(&self) -> (&'static str, String) {
        ("sparkobs", self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        serde_yaml::from_str(
            r#"
name: demo
region: us-west-2
network:
  vpc_cidr: 10.42.0.0/16
clusters:
  - name: analytics
    version: "1.31"
    instance_type: m5.xlarge
    nodes: 2
    namespace: spark-jobs
jobs:
  repository: demo/spark
  base_image: public.ecr.aws/emr-on-eks/spark/emr-7.2.0:latest
  release_label: emr-7.2.0-latest
dns:
  zone: observability.internal
shs:
  cluster: history
  version: "1.31"
  instance_type: m5.large
  nodes: 2
  domain: spark-history.observability.internal
vpn:
  client_cidr: 10.99.0.0/22
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_sample_config_valid() {
        let config = sample();
        assert!(config.validate().is_ok());
        assert_eq!(config.network_stack(), "demo-network");
        assert_eq!(config.eks_cluster("analytics"), "demo-analytics");
        assert_eq!(
            config.log_bucket("123456789012"),
            "demo-spark-logs-123456789012-us-west-2"
        );
    }

    #[test]
    fn test_missing_region_rejected() {
        let mut config = sample();
        config.region = String::new();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains("region")));
    }

    #[test]
    fn test_duplicate_cluster_rejected() {
        let mut config = sample();
        let duplicate = config.clusters[0].clone();
        config.clusters.push(duplicate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cluster_name_collision_with_shs_rejected() {
        let mut config = sample();
        config.clusters[0].name = "history".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_domain_outside_zone_rejected() {
        let mut config = sample();
        config.shs.domain = "spark-history.elsewhere.internal".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_uppercase_name_rejected() {
        let mut config = sample();
        config.name = "Demo".to_string();
        assert!(config.validate().is_err());
    }
}
