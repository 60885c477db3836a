//! Bootstrap script runner
//!
//! Every node runs the same three preparation steps followed by one
//! role-specific step. Steps are rendered up front and then executed in
//! order, each on a fresh session: the first step schedules a reboot, so the
//! next connection goes through the connect retry while the node comes back.

use std::sync::Arc;
use std::time::Duration;

use exokube_exec::{ConnectionInfo, Connector, Credential, ExecError, RetryNotify};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::error::CoreError;
use crate::node::NodeRole;

/// A named shell step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapStep {
    pub name: &'static str,
    pub template: &'static str,
    /// Context fields the template references
    pub requires: &'static [&'static str],
}

/// Steps shared by both roles
pub static NODE_STEPS: [BootstrapStep; 3] = [
    BootstrapStep {
        name: "Instance system upgrade",
        requires: &[],
        template: r#"set -xe

sudo -E DEBIAN_FRONTEND=noninteractive apt-get update
sudo -E DEBIAN_FRONTEND=noninteractive apt-get -o Dpkg::Options::="--force-confnew" upgrade -y
sudo -E DEBIAN_FRONTEND=noninteractive apt-get install -y \
	apt-transport-https \
	ca-certificates \
	curl \
	golang-cfssl \
	software-properties-common
nohup sh -c 'sleep 5s ; sudo reboot' &
exit"#,
    },
    BootstrapStep {
        name: "Docker Engine installation",
        requires: &["docker_version", "address"],
        template: r#"set -xe

curl -fsSL https://download.docker.com/linux/ubuntu/gpg | sudo apt-key add -

sudo add-apt-repository \
	"deb [arch=amd64] https://download.docker.com/linux/ubuntu \
	$(lsb_release -cs) \
	stable"

sudo -E DEBIAN_FRONTEND=noninteractive apt-get update

PKG_VERSION=$(apt-cache madison docker-ce | awk '$3 ~ /{{ docker_version }}/ { print $3 }' | sort -t : -k 2 -n | tail -n 1)
if [[ -z "${PKG_VERSION}" ]]; then
	echo "error: unable to find docker-ce package for version {{ docker_version }}" >&2
	exit 1
fi

sudo -E DEBIAN_FRONTEND=noninteractive apt-get install -y docker-ce=${PKG_VERSION}
sudo apt-mark hold docker-ce

cat <<EOF > csr.json
{
	"hosts": ["{{ address }}"],
	"key": {"algo": "rsa", "size": 2048},
	"names": [{"C": "CH", "L": "Lausanne", "O": "Exoscale", "OU": "exokube", "ST": ""}]
}
EOF

cfssl genkey -initca csr.json | cfssljson -bare ca

cfssl gencert \
	-ca ca.pem \
	-ca-key ca-key.pem \
	-hostname {{ address }} csr.json | cfssljson -bare

cat <<EOF | sudo tee /etc/docker/daemon.json
{
	"hosts": ["unix:///var/run/docker.sock", "tcp://0.0.0.0:2376"],
	"tlsverify": true,
	"tlscacert": "/etc/docker/ca.pem",
	"tlscert": "/etc/docker/cert.pem",
	"tlskey": "/etc/docker/key.pem",
	"exec-opts": ["native.cgroupdriver=systemd"],
	"storage-driver": "overlay2",
	"log-driver": "json-file",
	"log-opts": {
		"max-size": "100m"
	}
}
EOF

sudo mv ca.pem /etc/docker/ca.pem
sudo mv cert.pem /etc/docker/cert.pem
sudo mv cert-key.pem /etc/docker/key.pem
rm -f *.{csr,json,pem}

sudo mkdir -p /etc/systemd/system/docker.service.d/
cat <<EOF | sudo tee /etc/systemd/system/docker.service.d/override.conf
[Service]
ExecStart=
ExecStart=/usr/bin/dockerd
EOF
sudo systemctl daemon-reload \
 && sudo systemctl restart docker"#,
    },
    BootstrapStep {
        name: "Kubernetes cluster node installation",
        requires: &["kubernetes_version"],
        template: r#"set -xe

curl -fsSL https://packages.cloud.google.com/apt/doc/apt-key.gpg | sudo apt-key add -
cat <<EOF | sudo tee /etc/apt/sources.list.d/kubernetes.list
deb http://apt.kubernetes.io/ kubernetes-xenial main
EOF
sudo -E DEBIAN_FRONTEND=noninteractive apt-get update

PKG_VERSION=$(apt-cache madison kubelet | awk '$3 ~ /{{ kubernetes_version }}-/ { print $3 }' | sort -t "-" -k 2 -n | tail -n 1)
if [[ -z "${PKG_VERSION}" ]]; then
	echo "error: unable to find kubelet package for version {{ kubernetes_version }}" >&2
	exit 1
fi

sudo -E DEBIAN_FRONTEND=noninteractive apt-get install -y kubelet=${PKG_VERSION} \
	kubeadm=${PKG_VERSION} \
	kubectl=${PKG_VERSION}
sudo apt-mark hold kubelet kubeadm kubectl"#,
    },
];

/// Control-plane finishing step
pub static CONTROL_PLANE_INIT: BootstrapStep = BootstrapStep {
    name: "Kubernetes control-plane initialization",
    requires: &["kubernetes_version", "calico_version"],
    template: r#"set -xe

sudo kubeadm init \
	--pod-network-cidr=192.168.0.0/16 \
	--kubernetes-version "{{ kubernetes_version }}"
sudo kubectl --kubeconfig=/etc/kubernetes/admin.conf taint nodes --all node-role.kubernetes.io/master-
sudo kubectl --kubeconfig=/etc/kubernetes/admin.conf apply \
	-f https://docs.projectcalico.org/v{{ calico_version }}/getting-started/kubernetes/installation/hosted/etcd.yaml
sudo kubectl --kubeconfig=/etc/kubernetes/admin.conf apply \
	-f https://docs.projectcalico.org/v{{ calico_version }}/getting-started/kubernetes/installation/hosted/calico.yaml"#,
};

/// Worker finishing step
pub static WORKER_JOIN: BootstrapStep = BootstrapStep {
    name: "Kubernetes cluster join",
    requires: &["token", "master_ip", "master_port"],
    template: r#"set -xe

sudo kubeadm join \
	--token {{ token }} {{ master_ip }}:{{ master_port }} \
	--discovery-token-unsafe-skip-ca-verification"#,
};

/// Full step list for a role
#[must_use]
pub fn steps_for(role: NodeRole) -> Vec<&'static BootstrapStep> {
    let finish = match role {
        NodeRole::ControlPlane => &CONTROL_PLANE_INIT,
        NodeRole::Worker => &WORKER_JOIN,
    };
    NODE_STEPS.iter().chain(std::iter::once(finish)).collect()
}

/// Values substituted into step templates
///
/// Unset fields are left out of the rendering context, so a template that
/// references one fails to render.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TemplateContext {
    pub address: String,
    pub kubernetes_version: String,
    pub docker_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calico_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_port: Option<u16>,
}

impl TemplateContext {
    fn has(&self, field: &str) -> bool {
        match field {
            "address" => !self.address.is_empty(),
            "kubernetes_version" => !self.kubernetes_version.is_empty(),
            "docker_version" => !self.docker_version.is_empty(),
            "calico_version" => self.calico_version.is_some(),
            "token" => self.token.is_some(),
            "master_ip" => self.master_ip.is_some(),
            "master_port" => self.master_port.is_some(),
            _ => false,
        }
    }
}

/// A step ready to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedStep {
    pub name: &'static str,
    pub command: String,
}

pub(crate) fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env
}

/// Render every step, failing on the first one that cannot be rendered
///
/// # Errors
/// Returns `CoreError::Template` naming the step
pub fn render_steps(
    steps: &[&BootstrapStep],
    ctx: &TemplateContext,
) -> Result<Vec<RenderedStep>, CoreError> {
    let env = environment();
    steps
        .iter()
        .map(|step| {
            if let Some(missing) = step.requires.iter().find(|f| !ctx.has(f)) {
                return Err(CoreError::Template {
                    step: step.name.to_string(),
                    message: format!("missing field {missing}"),
                });
            }
            let command = env
                .render_str(step.template, ctx)
                .map_err(|e| CoreError::Template {
                    step: step.name.to_string(),
                    message: e.to_string(),
                })?;
            Ok(RenderedStep {
                name: step.name,
                command,
            })
        })
        .collect()
}

/// Longest a single command may run unless the runner is told otherwise
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Runs bootstrap steps on one node
pub struct BootstrapRunner {
    connector: Arc<dyn Connector>,
    target: ConnectionInfo,
    credential: Credential,
    notify: Option<RetryNotify>,
    step_timeout: Duration,
}

impl BootstrapRunner {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, target: ConnectionInfo, credential: Credential) -> Self {
        Self {
            connector,
            target,
            credential,
            notify: None,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Fail any command still running after `timeout`
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Call `notify` before each connection retry
    #[must_use]
    pub fn with_notify(mut self, notify: RetryNotify) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Run the role's step list
    ///
    /// # Errors
    /// See [`BootstrapRunner::run_steps`]
    pub async fn run(&self, role: NodeRole, ctx: &TemplateContext) -> Result<(), CoreError> {
        self.run_steps(&steps_for(role), ctx).await
    }

    /// Render all steps, then run them in order, stopping at the first failure
    ///
    /// # Errors
    /// Returns `CoreError::Template` before anything runs if a step does not
    /// render, else `CoreError::StepFailed` with the failing step's name and
    /// its stderr
    #[instrument(skip(self, steps, ctx), fields(host = %self.target.host, steps = steps.len()))]
    pub async fn run_steps(
        &self,
        steps: &[&BootstrapStep],
        ctx: &TemplateContext,
    ) -> Result<(), CoreError> {
        let rendered = render_steps(steps, ctx)?;

        for step in rendered {
            info!(step = step.name, "running bootstrap step");
            let result = match self.connect().await {
                Ok(session) => session.run_checked(&step.command, self.step_timeout).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                let stderr = e.stderr().map_or_else(|| e.to_string(), str::to_string);
                error!(step = step.name, %stderr, "bootstrap step failed");
                return Err(CoreError::StepFailed {
                    step: step.name.to_string(),
                    stderr,
                });
            }
            info!(step = step.name, "bootstrap step succeeded");
        }
        Ok(())
    }

    /// Run one command and return its stdout
    ///
    /// # Errors
    /// Returns `CoreError::Exec` if the node cannot be reached or the command
    /// exits non-zero
    #[instrument(skip(self), fields(host = %self.target.host))]
    pub async fn fetch(&self, cmd: &str) -> Result<String, CoreError> {
        let session = self.connect().await?;
        Ok(session.run_checked(cmd, self.step_timeout).await?.stdout)
    }

    async fn connect(&self) -> Result<Arc<dyn exokube_exec::RemoteExecutor>, ExecError> {
        self.connector
            .connect(&self.target, &self.credential, self.notify.clone())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_plane_ctx() -> TemplateContext {
        TemplateContext {
            address: "192.0.2.10".into(),
            kubernetes_version: "1.13.1".into(),
            docker_version: "18.06".into(),
            calico_version: Some("3.4".into()),
            ..TemplateContext::default()
        }
    }

    #[test]
    fn test_role_step_lists() {
        let cp = steps_for(NodeRole::ControlPlane);
        let worker = steps_for(NodeRole::Worker);
        assert_eq!(cp.len(), 4);
        assert_eq!(worker.len(), 4);
        assert_eq!(cp[..3], worker[..3]);
        assert_eq!(cp[3].name, CONTROL_PLANE_INIT.name);
        assert_eq!(worker[3].name, WORKER_JOIN.name);
    }

    #[test]
    fn test_render_control_plane() {
        let rendered = render_steps(&steps_for(NodeRole::ControlPlane), &control_plane_ctx()).unwrap();

        assert!(rendered[1].command.contains(r#""hosts": ["192.0.2.10"]"#));
        assert!(rendered[1].command.contains("awk '$3 ~ /18.06/"));
        assert!(rendered[1].command.contains("${PKG_VERSION}"));
        assert!(rendered[3].command.contains(r#"--kubernetes-version "1.13.1""#));
        assert!(rendered[3].command.contains("/v3.4/getting-started"));
    }

    #[test]
    fn test_render_worker_join() {
        let ctx = TemplateContext {
            token: Some("abcdef.0123456789abcdef".into()),
            master_ip: Some("192.0.2.10".into()),
            master_port: Some(6443),
            calico_version: None,
            ..control_plane_ctx()
        };
        let rendered = render_steps(&[&WORKER_JOIN], &ctx).unwrap();
        assert!(
            rendered[0]
                .command
                .contains("--token abcdef.0123456789abcdef 192.0.2.10:6443")
        );
    }

    #[test]
    fn test_missing_field_fails_before_running() {
        let err = render_steps(&steps_for(NodeRole::Worker), &control_plane_ctx()).unwrap_err();
        assert_eq!(err.step(), Some(WORKER_JOIN.name));
    }

    #[test]
    fn test_undeclared_undefined_field_is_an_error() {
        let step = BootstrapStep {
            name: "probe",
            template: "echo {{ token }}",
            requires: &[],
        };
        let err = render_steps(&[&step], &control_plane_ctx()).unwrap_err();
        assert!(matches!(err, CoreError::Template { ref step, .. } if step == "probe"));
    }
}
