use async_trait::async_trait;
use aws_sdk_autoscaling::Client as AsgClient;
use aws_sdk_ec2::Client as Ec2Client;
use aws_sdk_ec2::types::InstanceStateName;
use aws_sdk_elasticloadbalancingv2::Client as ElbClient;
use aws_sdk_elasticloadbalancingv2::types::TargetDescription;

use crate::error::StoreError;

#[derive(Clone, Debug)]
pub struct Instance {
    pub instance_id: String,
    pub private_ip: Option<String>,
    pub private_dns: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleResult {
    Continue,
    Abandon,
}

impl LifecycleResult {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleResult::Continue => "CONTINUE",
            LifecycleResult::Abandon => "ABANDON",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleCompletion {
    pub group_name: String,
    pub hook_name: String,
    pub instance_id: String,
    /// Omitted on the instance-only completion retry.
    pub action_token: Option<String>,
    pub result: LifecycleResult,
}

#[async_trait]
pub trait Fleet: Send + Sync {
    /// Control-plane instances that are InService and Healthy in the scaling
    /// group and running in EC2, with their private addresses.
    async fn healthy_control_plane(&self) -> Result<Vec<Instance>, StoreError>;

    async fn register_target(&self, instance_id: &str) -> Result<(), StoreError>;

    async fn deregister_target(&self, instance_id: &str) -> Result<(), StoreError>;

    async fn complete_lifecycle_action(
        &self,
        completion: &LifecycleCompletion,
    ) -> Result<(), StoreError>;
}

pub struct Ec2Fleet {
    asg: AsgClient,
    ec2: Ec2Client,
    elb: ElbClient,
    group_name: String,
    target_group_arn: String,
}

impl Ec2Fleet {
    pub fn new(
        asg: AsgClient,
        ec2: Ec2Client,
        elb: ElbClient,
        group_name: impl Into<String>,
        target_group_arn: impl Into<String>,
    ) -> Self {
        Self {
            asg,
            ec2,
            elb,
            group_name: group_name.into(),
            target_group_arn: target_group_arn.into(),
        }
    }

    async fn in_service_instance_ids(&self) -> Result<Vec<String>, StoreError> {
        let output = self
            .asg
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(&self.group_name)
            .send()
            .await
            .map_err(|err| StoreError::api("asg describe-auto-scaling-groups", err))?;

        let mut ids = Vec::new();
        for group in output.auto_scaling_groups() {
            for instance in group.instances() {
                let in_service = instance
                    .lifecycle_state()
                    .is_some_and(|state| state.as_str() == "InService");
                let healthy = instance
                    .health_status()
                    .is_some_and(|status| status == "Healthy");
                if in_service && healthy {
                    if let Some(id) = instance.instance_id() {
                        ids.push(id.to_string());
                    }
                }
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl Fleet for Ec2Fleet {
    async fn healthy_control_plane(&self) -> Result<Vec<Instance>, StoreError> {
        let ids = self.in_service_instance_ids().await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let output = self
            .ec2
            .describe_instances()
            .set_instance_ids(Some(ids))
            .send()
            .await
            .map_err(|err| StoreError::api("ec2 describe-instances", err))?;

        let mut instances = Vec::new();
        for reservation in output.reservations() {
            for instance in reservation.instances() {
                let running = instance
                    .state()
                    .and_then(|state| state.name())
                    .is_some_and(|name| *name == InstanceStateName::Running);
                if !running {
                    continue;
                }
                let Some(id) = instance.instance_id() else { continue };
                instances.push(Instance {
                    instance_id: id.to_string(),
                    private_ip: instance.private_ip_address().map(|ip| ip.to_string()),
                    private_dns: instance
                        .private_dns_name()
                        .filter(|name| !name.is_empty())
                        .map(|name| name.to_string()),
                });
            }
        }
        Ok(instances)
    }

    async fn register_target(&self, instance_id: &str) -> Result<(), StoreError> {
        let target = TargetDescription::builder().id(instance_id).build();
        self.elb
            .register_targets()
            .target_group_arn(&self.target_group_arn)
            .targets(target)
            .send()
            .await
            .map_err(|err| StoreError::api("elbv2 register-targets", err))?;
        Ok(())
    }

    async fn deregister_target(&self, instance_id: &str) -> Result<(), StoreError> {
        let target = TargetDescription::builder().id(instance_id).build();
        self.elb
            .deregister_targets()
            .target_group_arn(&self.target_group_arn)
            .targets(target)
            .send()
            .await
            .map_err(|err| StoreError::api("elbv2 deregister-targets", err))?;
        Ok(())
    }

    async fn complete_lifecycle_action(
        &self,
        completion: &LifecycleCompletion,
    ) -> Result<(), StoreError> {
        let mut request = self
            .asg
            .complete_lifecycle_action()
            .auto_scaling_group_name(&completion.group_name)
            .lifecycle_hook_name(&completion.hook_name)
            .instance_id(&completion.instance_id)
            .lifecycle_action_result(completion.result.as_str());
        if let Some(ref token) = completion.action_token {
            request = request.lifecycle_action_token(token);
        }
        request
            .send()
            .await
            .map_err(|err| StoreError::api("asg complete-lifecycle-action", err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_results_use_the_asg_vocabulary() {
        assert_eq!(LifecycleResult::Continue.as_str(), "CONTINUE");
        assert_eq!(LifecycleResult::Abandon.as_str(), "ABANDON");
    }
}
