//! IAM roles, inline policies, and OIDC federation (IRSA)

use crate::error::Error;
use aws_sdk_iam::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Thumbprint registered on EKS OIDC providers. IAM no longer verifies
/// thumbprints for issuers backed by trusted roots, but the API still
/// requires one.
const OIDC_ROOT_THUMBPRINT: &str = "9e99a48a9960b14926bb7f3b02e22da2b0ab7280";

/// ARN of an IAM role in an account
pub fn role_arn(account: &str, role: &str) -> String {
    format!("arn:aws:iam::{account}:role/{role}")
}

/// ARN of an OIDC provider for an issuer host/path
pub fn oidc_provider_arn(account: &str, issuer: &str) -> String {
    format!("arn:aws:iam::{account}:oidc-provider/{issuer}")
}

/// Trust policy allowing an AWS service principal to assume the role
pub fn service_trust_policy(service: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole"
        }]
    })
}

/// Trust policy binding a role to one Kubernetes service account via the
/// cluster's OIDC provider
pub fn irsa_trust_policy(account: &str, issuer: &str, namespace: &str, service_account: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Federated": oidc_provider_arn(account, issuer) },
            "Action": "sts:AssumeRoleWithWebIdentity",
            "Condition": {
                "StringEquals": {
                    (format!("{issuer}:aud")): "sts.amazonaws.com",
                    (format!("{issuer}:sub")): format!("system:serviceaccount:{namespace}:{service_account}")
                }
            }
        }]
    })
}

/// Trust policy for an EMR-on-EKS job execution role: the base service
/// trust plus the federated statement EMR's managed service accounts use.
/// The service-account name is generated per job, hence the wildcard.
pub fn emr_job_trust_policy(account: &str, issuer: &str, namespace: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Principal": { "Service": "emr-containers.amazonaws.com" },
                "Action": "sts:AssumeRole"
            },
            {
                "Effect": "Allow",
                "Principal": { "Federated": oidc_provider_arn(account, issuer) },
                "Action": "sts:AssumeRoleWithWebIdentity",
                "Condition": {
                    "StringLike": {
                        (format!("{issuer}:sub")):
                            format!("system:serviceaccount:{namespace}:emr-containers-sa-*-*-{account}-*")
                    }
                }
            }
        ]
    })
}

/// Policy granting read/write access to the Spark event-log bucket
pub fn log_bucket_policy(bucket: &str, write: bool) -> Value {
    let mut actions = vec!["s3:GetObject", "s3:ListBucket"];
    if write {
        actions.push("s3:PutObject");
        actions.push("s3:DeleteObject");
    }
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": actions,
                "Resource": [
                    format!("arn:aws:s3:::{bucket}"),
                    format!("arn:aws:s3:::{bucket}/*")
                ]
            },
            {
                "Effect": "Allow",
                "Action": [
                    "logs:CreateLogGroup",
                    "logs:CreateLogStream",
                    "logs:PutLogEvents",
                    "logs:DescribeLogGroups",
                    "logs:DescribeLogStreams"
                ],
                "Resource": "*"
            }
        ]
    })
}

/// Permissions the AWS Load Balancer Controller needs to manage ALBs for
/// ingresses (condensed from the controller's published policy)
pub fn alb_controller_policy() -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": [
                    "ec2:DescribeAccountAttributes",
                    "ec2:DescribeAvailabilityZones",
                    "ec2:DescribeInternetGateways",
                    "ec2:DescribeVpcs",
                    "ec2:DescribeSubnets",
                    "ec2:DescribeSecurityGroups",
                    "ec2:DescribeInstances",
                    "ec2:DescribeNetworkInterfaces",
                    "ec2:DescribeTags",
                    "ec2:CreateSecurityGroup",
                    "ec2:CreateTags",
                    "ec2:DeleteTags",
                    "ec2:AuthorizeSecurityGroupIngress",
                    "ec2:RevokeSecurityGroupIngress",
                    "ec2:DeleteSecurityGroup"
                ],
                "Resource": "*"
            },
            {
                "Effect": "Allow",
                "Action": [
                    "elasticloadbalancing:*"
                ],
                "Resource": "*"
            },
            {
                "Effect": "Allow",
                "Action": [
                    "acm:ListCertificates",
                    "acm:DescribeCertificate",
                    "iam:CreateServiceLinkedRole",
                    "cognito-idp:DescribeUserPoolClient",
                    "wafv2:GetWebAcl",
                    "wafv2:AssociateWebAcl",
                    "wafv2:DisassociateWebAcl",
                    "shield:GetSubscriptionState"
                ],
                "Resource": "*"
            }
        ]
    })
}

/// Creates the role if absent; an existing role is left untouched here
/// (its trust policy can be re-synced with [`patch_trust_policy`])
pub async fn ensure_role(client: &Client, role: &str, trust_policy: &Value) -> Result<(), Error> {
    let result = client
        .create_role()
        .role_name(role)
        .assume_role_policy_document(trust_policy.to_string())
        .send()
        .await;
    match result {
        Ok(_) => {
            info!(role, "created role");
            Ok(())
        }
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err.is_entity_already_exists_exception() {
                debug!(role, "role already exists");
                Ok(())
            } else {
                Err(Error::AwsIam {
                    entity: role.to_string(),
                    operation: "CreateRole",
                    source: Box::new(aws_sdk_iam::Error::from(service_err)),
                })
            }
        }
    }
}

/// Replaces the role's trust policy (OIDC federation patching)
pub async fn patch_trust_policy(
    client: &Client,
    role: &str,
    trust_policy: &Value,
) -> Result<(), Error> {
    client
        .update_assume_role_policy()
        .role_name(role)
        .policy_document(trust_policy.to_string())
        .send()
        .await
        .map_err(|e| Error::AwsIam {
            entity: role.to_string(),
            operation: "UpdateAssumeRolePolicy",
            source: Box::new(aws_sdk_iam::Error::from(e.into_service_error())),
        })?;
    info!(role, "patched trust policy");
    Ok(())
}

/// Attaches a managed policy; attaching an already-attached policy is
/// idempotent on the service side
pub async fn attach_managed_policy(
    client: &Client,
    role: &str,
    policy_arn: &str,
) -> Result<(), Error> {
    client
        .attach_role_policy()
        .role_name(role)
        .policy_arn(policy_arn)
        .send()
        .await
        .map_err(|e| Error::AwsIam {
            entity: role.to_string(),
            operation: "AttachRolePolicy",
            source: Box::new(aws_sdk_iam::Error::from(e.into_service_error())),
        })?;
    debug!(role, policy_arn, "attached managed policy");
    Ok(())
}

/// Writes (or overwrites) an inline policy on the role
pub async fn put_inline_policy(
    client: &Client,
    role: &str,
    policy_name: &str,
    document: &Value,
) -> Result<(), Error> {
    client
        .put_role_policy()
        .role_name(role)
        .policy_name(policy_name)
        .policy_document(document.to_string())
        .send()
        .await
        .map_err(|e| Error::AwsIam {
            entity: role.to_string(),
            operation: "PutRolePolicy",
            source: Box::new(aws_sdk_iam::Error::from(e.into_service_error())),
        })?;
    debug!(role, policy_name, "put inline policy");
    Ok(())
}

/// Registers the cluster's OIDC issuer as an identity provider if it is
/// not registered yet, returning the provider ARN
pub async fn ensure_oidc_provider(
    client: &Client,
    account: &str,
    issuer: &str,
) -> Result<String, Error> {
    let expected = oidc_provider_arn(account, issuer);
    let resp = client
        .list_open_id_connect_providers()
        .send()
        .await
        .map_err(|e| Error::AwsIam {
            entity: issuer.to_string(),
            operation: "ListOpenIDConnectProviders",
            source: Box::new(aws_sdk_iam::Error::from(e.into_service_error())),
        })?;
    for provider in resp.open_id_connect_provider_list() {
        if provider.arn() == Some(expected.as_str()) {
            debug!(issuer, "OIDC provider already registered");
            return Ok(expected);
        }
    }

    let result = client
        .create_open_id_connect_provider()
        .url(format!("https://{issuer}"))
        .client_id_list("sts.amazonaws.com")
        .thumbprint_list(OIDC_ROOT_THUMBPRINT)
        .send()
        .await;
    match result {
        Ok(_) => {
            info!(issuer, "registered OIDC provider");
            Ok(expected)
        }
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err.is_entity_already_exists_exception() {
                debug!(issuer, "OIDC provider already registered");
                Ok(expected)
            } else {
                Err(Error::AwsIam {
                    entity: issuer.to_string(),
                    operation: "CreateOpenIDConnectProvider",
                    source: Box::new(aws_sdk_iam::Error::from(service_err)),
                })
            }
        }
    }
}

/// Deletes an OIDC provider; an absent provider is a no-op
pub async fn delete_oidc_provider_if_exists(client: &Client, arn: &str) -> Result<(), Error> {
    let result = client
        .delete_open_id_connect_provider()
        .open_id_connect_provider_arn(arn)
        .send()
        .await;
    match result {
        Ok(_) => {
            info!(arn, "deleted OIDC provider");
            Ok(())
        }
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err.is_no_such_entity_exception() {
                info!(arn, "OIDC provider does not exist, nothing to delete");
                Ok(())
            } else {
                Err(Error::AwsIam {
                    entity: arn.to_string(),
                    operation: "DeleteOpenIDConnectProvider",
                    source: Box::new(aws_sdk_iam::Error::from(service_err)),
                })
            }
        }
    }
}

/// Deletes a role after detaching managed policies and removing inline
/// policies; an absent role is a no-op
pub async fn delete_role_if_exists(client: &Client, role: &str) -> Result<(), Error> {
    let attached = client
        .list_attached_role_policies()
        .role_name(role)
        .send()
        .await;
    let attached = match attached {
        Ok(resp) => resp,
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err.is_no_such_entity_exception() {
                info!(role, "role does not exist, nothing to delete");
                return Ok(());
            }
            return Err(Error::AwsIam {
                entity: role.to_string(),
                operation: "ListAttachedRolePolicies",
                source: Box::new(aws_sdk_iam::Error::from(service_err)),
            });
        }
    };
    for policy in attached.attached_policies() {
        if let Some(policy_arn) = policy.policy_arn() {
            client
                .detach_role_policy()
                .role_name(role)
                .policy_arn(policy_arn)
                .send()
                .await
                .map_err(|e| Error::AwsIam {
                    entity: role.to_string(),
                    operation: "DetachRolePolicy",
                    source: Box::new(aws_sdk_iam::Error::from(e.into_service_error())),
                })?;
        }
    }

    let inline = client
        .list_role_policies()
        .role_name(role)
        .send()
        .await
        .map_err(|e| Error::AwsIam {
            entity: role.to_string(),
            operation: "ListRolePolicies",
            source: Box::new(aws_sdk_iam::Error::from(e.into_service_error())),
        })?;
    for policy_name in inline.policy_names() {
        client
            .delete_role_policy()
            .role_name(role)
            .policy_name(policy_name)
            .send()
            .await
            .map_err(|e| Error::AwsIam {
                entity: role.to_string(),
                operation: "DeleteRolePolicy",
                source: Box::new(aws_sdk_iam::Error::from(e.into_service_error())),
            })?;
    }

    client
        .delete_role()
        .role_name(role)
        .send()
        .await
        .map_err(|e| Error::AwsIam {
            entity: role.to_string(),
            operation: "DeleteRole",
            source: Box::new(aws_sdk_iam::Error::from(e.into_service_error())),
        })?;
    info!(role, "deleted role");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_arn_format() {
        assert_eq!(
            role_arn("123456789012", "demo-shs"),
            "arn:aws:iam::123456789012:role/demo-shs"
        );
    }

    #[test]
    fn test_irsa_trust_policy_binds_service_account() {
        let issuer = "oidc.eks.us-west-2.amazonaws.com/id/ABCDEF";
        let policy = irsa_trust_policy("123456789012", issuer, "shs", "spark-history-server");
        let condition = &policy["Statement"][0]["Condition"]["StringEquals"];
        assert_eq!(
            condition[format!("{issuer}:sub")],
            "system:serviceaccount:shs:spark-history-server"
        );
        assert_eq!(condition[format!("{issuer}:aud")], "sts.amazonaws.com");
        assert_eq!(
            policy["Statement"][0]["Principal"]["Federated"],
            format!("arn:aws:iam::123456789012:oidc-provider/{issuer}")
        );
    }

    #[test]
    fn test_emr_job_trust_policy_has_service_and_federated_statements() {
        let issuer = "oidc.eks.us-west-2.amazonaws.com/id/ABCDEF";
        let policy = emr_job_trust_policy("123456789012", issuer, "spark-jobs");
        let statements = policy["Statement"].as_array().unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0]["Principal"]["Service"],
            "emr-containers.amazonaws.com"
        );
        let sub = statements[1]["Condition"]["StringLike"][format!("{issuer}:sub")]
            .as_str()
            .unwrap();
        assert!(sub.starts_with("system:serviceaccount:spark-jobs:emr-containers-sa-"));
    }

    #[test]
    fn test_log_bucket_policy_write_flag() {
        let read_only = log_bucket_policy("demo-logs", false);
        let actions = read_only["Statement"][0]["Action"].as_array().unwrap();
        assert!(!actions.iter().any(|a| a == "s3:PutObject"));

        let writable = log_bucket_policy("demo-logs", true);
        let actions = writable["Statement"][0]["Action"].as_array().unwrap();
        assert!(actions.iter().any(|a| a == "s3:PutObject"));
    }
}
