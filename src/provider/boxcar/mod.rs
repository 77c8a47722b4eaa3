//! Reference VM provider backed by the Boxcar instance control plane.
//!
//! Boxcar exposes a small REST API for booting instances from named
//! images. The provider resolves job attributes to an image through an
//! alias table, boots an instance, polls until it is SSH-reachable, and
//! then drives the build over SSH.

mod api;
mod ssh;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::cancel::{CancelReason, JobCancellation};
use crate::logwriter::LogWriter;
use crate::provider::registry::ProviderRegistration;
use crate::provider::{
    Instance, InstanceError, Provider, ProviderConfig, ProviderError, RunResult, StartAttributes,
};
use api::{ApiClient, InstancePayload};
use ssh::SshAccess;

const DEFAULT_BOOT_POLL_SLEEP: Duration = Duration::from_secs(3);
const DEFAULT_SSH_PORT: u16 = 22;
const SSH_USER: &str = "travis";

/// Port the wrapper script waits on before starting the build.
const PROBE_PORT: u16 = 15_782;

const BOOT_METRIC: &str = "worker.vm.provider.boxcar.boot";
const BOOT_TIMEOUT_METRIC: &str = "worker.vm.provider.boxcar.boot.timeout";

const HELP: &[(&str, &str)] = &[
    (
        "ENDPOINT",
        "[REQUIRED] URL of the Boxcar instance API, with the auth token in the userinfo portion",
    ),
    (
        "SSH_KEY_PATH",
        "[REQUIRED] path to the SSH key used to access job VMs",
    ),
    (
        "SSH_KEY_PASSPHRASE",
        "[REQUIRED] passphrase for the SSH key given as SSH_KEY_PATH",
    ),
    (
        "KEYCHAIN_PASSWORD",
        "[REQUIRED] password for the keychain baked into macOS images",
    ),
    (
        "IMAGE_ALIASES",
        "[REQUIRED] comma-delimited strings used as stable names for images",
    ),
    (
        "IMAGE_ALIAS_{ALIAS}",
        "full image name for an alias from IMAGE_ALIASES; the alias in the key is uppercased with non-alphanumerics replaced by _",
    ),
    (
        "BOOT_POLL_SLEEP",
        "sleep interval between instance status polls (default 3s)",
    ),
];

/// Returns the registry entry for this backend.
#[must_use]
pub fn registration() -> ProviderRegistration {
    ProviderRegistration {
        name: "boxcar",
        label: "Boxcar",
        help: HELP,
        factory: |config| BoxcarProvider::new(config).map(|p| Arc::new(p) as Arc<dyn Provider>),
    }
}

fn wrapper_script() -> String {
    format!(
        "#!/bin/bash\n\
         \n\
         [[ $(uname) = Linux ]] && exec bash ~/build.sh\n\
         \n\
         [[ -f ~/build.sh.exit ]] && rm ~/build.sh.exit\n\
         \n\
         until nc 127.0.0.1 {PROBE_PORT}; do sleep 1; done\n\
         \n\
         until [[ -f ~/build.sh.exit ]]; do sleep 1; done\n\
         exit $(cat ~/build.sh.exit)\n"
    )
}

/// Uppercases an alias and replaces every non-alphanumeric character with
/// `_`, producing the suffix of its `IMAGE_ALIAS_*` configuration key.
fn normalize_alias(alias: &str) -> String {
    alias
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Sanitizes an image name for use inside a metric name.
fn metric_image_name(image: &str) -> String {
    image
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | ':' | '-' | '_') {
                ch
            } else {
                '-'
            }
        })
        .collect()
}

fn first_ipv4(addresses: &[String]) -> Option<Ipv4Addr> {
    addresses.iter().find_map(|text| text.parse().ok())
}

/// Provider that boots build VMs through the Boxcar API.
#[derive(Debug)]
pub struct BoxcarProvider {
    api: ApiClient,
    ssh: SshAccess,
    image_aliases: BTreeMap<String, String>,
    boot_poll_sleep: Duration,
}

impl BoxcarProvider {
    /// Constructs a provider from its configuration map.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when a required key is missing or
    /// unparsable.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        if !config.is_set("ENDPOINT") {
            return Err(ProviderError::Config(String::from(
                "expected ENDPOINT config key",
            )));
        }
        let api = ApiClient::new(config.get("ENDPOINT"))?;

        if !config.is_set("IMAGE_ALIASES") {
            return Err(ProviderError::Config(String::from(
                "expected IMAGE_ALIASES config key",
            )));
        }
        let mut image_aliases = BTreeMap::new();
        for alias in config
            .get("IMAGE_ALIASES")
            .split(',')
            .filter(|alias| !alias.is_empty())
        {
            let key = format!("IMAGE_ALIAS_{}", normalize_alias(alias));
            if !config.is_set(&key) {
                return Err(ProviderError::Config(format!(
                    "expected image alias {alias:?}"
                )));
            }
            image_aliases.insert(alias.to_owned(), config.get(&key).to_owned());
        }

        for key in ["SSH_KEY_PATH", "SSH_KEY_PASSPHRASE", "KEYCHAIN_PASSWORD"] {
            if !config.is_set(key) {
                return Err(ProviderError::Config(format!("expected {key} config key")));
            }
        }

        let boot_poll_sleep = if config.is_set("BOOT_POLL_SLEEP") {
            humantime::parse_duration(config.get("BOOT_POLL_SLEEP"))
                .map_err(|err| ProviderError::Config(format!("invalid BOOT_POLL_SLEEP: {err}")))?
        } else {
            DEFAULT_BOOT_POLL_SLEEP
        };

        Ok(Self {
            api,
            ssh: SshAccess {
                key_path: Utf8PathBuf::from(config.get("SSH_KEY_PATH")),
                key_passphrase: config.get("SSH_KEY_PASSPHRASE").to_owned(),
                user: String::from(SSH_USER),
                port: DEFAULT_SSH_PORT,
            },
            image_aliases,
            boot_poll_sleep,
        })
    }

    /// Resolves start attributes to an image name through the alias table,
    /// consulting keys in precedence order and returning the first hit.
    fn image_name(&self, attributes: &StartAttributes) -> Option<&str> {
        let StartAttributes {
            language,
            os,
            dist,
            group,
            osx_image,
        } = attributes;
        let candidates = [
            osx_image.clone(),
            format!("osx_image_{osx_image}"),
            format!("osx_image_{osx_image}_{language}"),
            format!("dist_{dist}_{language}"),
            format!("dist_{dist}"),
            format!("group_{group}_{language}"),
            format!("group_{group}"),
            format!("language_{language}"),
            format!("default_{os}"),
        ];
        candidates
            .iter()
            .find_map(|key| self.image_aliases.get(key))
            .map(String::as_str)
    }

    fn instance(&self, payload: Option<InstancePayload>) -> BoxcarInstance {
        BoxcarInstance {
            payload,
            api: self.api.clone(),
            ssh: self.ssh.clone(),
        }
    }

    async fn stop_partial(&self, payload: &InstancePayload) {
        let instance = self.instance(Some(payload.clone()));
        if let Err(err) = instance.stop().await {
            warn!(
                instance_id = %payload.id,
                error = %err,
                "failed to stop instance after aborted boot"
            );
        }
    }
}

#[async_trait]
impl Provider for BoxcarProvider {
    async fn setup(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn start(
        &self,
        cancel: &JobCancellation,
        attributes: &StartAttributes,
    ) -> Result<Box<dyn Instance>, ProviderError> {
        let image = self
            .image_name(attributes)
            .ok_or_else(|| ProviderError::NoImageAlias {
                language: attributes.language.clone(),
                os: attributes.os.clone(),
                dist: attributes.dist.clone(),
                group: attributes.group.clone(),
                osx_image: attributes.osx_image.clone(),
            })?
            .to_owned();
        info!(
            image_name = %image,
            language = %attributes.language,
            dist = %attributes.dist,
            group = %attributes.group,
            os = %attributes.os,
            osx_image = %attributes.osx_image,
            "selected image name"
        );

        let boot_started = Instant::now();
        let created = self.api.create_instance(&image).await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let poller = tokio::spawn(poll_until_reachable(
            self.api.clone(),
            created.id.clone(),
            self.ssh.port,
            self.boot_poll_sleep,
            ready_tx,
        ));

        let ready = tokio::select! {
            ready = ready_rx => ready,
            () = cancel.cancelled() => {
                poller.abort();
                let reason = cancel.reason().unwrap_or(CancelReason::Shutdown);
                if reason == CancelReason::HardTimeout {
                    counter!(BOOT_TIMEOUT_METRIC).increment(1);
                }
                self.stop_partial(&created).await;
                return Err(ProviderError::Cancelled { reason });
            }
        };

        match ready {
            Ok(Ok(payload)) => {
                let elapsed = boot_started.elapsed().as_secs_f64();
                histogram!(BOOT_METRIC).record(elapsed);
                histogram!(format!("{BOOT_METRIC}.image.{}", metric_image_name(&image)))
                    .record(elapsed);
                info!(instance_id = %payload.id, "booted instance");
                Ok(Box::new(self.instance(Some(payload))))
            }
            Ok(Err(err)) => {
                self.stop_partial(&created).await;
                Err(err)
            }
            Err(_) => {
                self.stop_partial(&created).await;
                Err(ProviderError::Http {
                    message: String::from("boot poller exited unexpectedly"),
                })
            }
        }
    }
}

/// Polls the control plane until the instance has an IPv4 address with a
/// reachable SSH port, then hands the payload back over `ready`.
async fn poll_until_reachable(
    api: ApiClient,
    id: String,
    ssh_port: u16,
    interval: Duration,
    ready: oneshot::Sender<Result<InstancePayload, ProviderError>>,
) {
    let outcome = loop {
        let payload = match api.get_instance(&id).await {
            Ok(payload) => payload,
            Err(err) => break Err(err),
        };
        if let Some(ip) = first_ipv4(&payload.ip_addresses) {
            if tokio::net::TcpStream::connect((ip, ssh_port)).await.is_ok() {
                break Ok(payload);
            }
        }
        tokio::time::sleep(interval).await;
    };
    let _ = ready.send(outcome);
}

/// One booted Boxcar VM.
#[derive(Debug)]
pub struct BoxcarInstance {
    payload: Option<InstancePayload>,
    api: ApiClient,
    ssh: SshAccess,
}

impl BoxcarInstance {
    fn ipv4(&self) -> Result<Ipv4Addr, InstanceError> {
        self.payload
            .as_ref()
            .and_then(|payload| first_ipv4(&payload.ip_addresses))
            .ok_or_else(|| InstanceError::Ssh {
                message: String::from("no valid IPv4 address"),
            })
    }

    fn cancel_reason(cancel: &JobCancellation) -> CancelReason {
        cancel.reason().unwrap_or(CancelReason::Shutdown)
    }

    fn cancelled(cancel: &JobCancellation) -> InstanceError {
        InstanceError::Cancelled {
            reason: Self::cancel_reason(cancel),
        }
    }

    /// Dials the instance's SSH port and returns the stream for the
    /// session plus a clone of it. Shutting the clone down makes a
    /// blocked session read fail, which is how a cancelled job
    /// interrupts the blocking SSH helper.
    async fn dial(
        &self,
        cancel: &JobCancellation,
    ) -> Result<(TcpStream, TcpStream), InstanceError> {
        let ip = self.ipv4()?;
        let stream = tokio::select! {
            stream = tokio::net::TcpStream::connect((ip, self.ssh.port)) => {
                stream.map_err(|err| InstanceError::Ssh {
                    message: err.to_string(),
                })?
            }
            () = cancel.cancelled() => return Err(Self::cancelled(cancel)),
        };
        let stream = stream.into_std().map_err(|err| InstanceError::Ssh {
            message: err.to_string(),
        })?;
        stream
            .set_nonblocking(false)
            .map_err(|err| InstanceError::Ssh {
                message: err.to_string(),
            })?;
        let interrupt = stream.try_clone().map_err(|err| InstanceError::Ssh {
            message: err.to_string(),
        })?;
        Ok((stream, interrupt))
    }
}

#[async_trait]
impl Instance for BoxcarInstance {
    async fn upload_script(
        &self,
        cancel: &JobCancellation,
        script: &[u8],
    ) -> Result<(), InstanceError> {
        let (tcp, interrupt) = self.dial(cancel).await?;
        let access = self.ssh.clone();
        let script = script.to_vec();
        let wrapper = wrapper_script().into_bytes();
        let mut upload =
            tokio::task::spawn_blocking(move || ssh::upload_script(&access, tcp, &script, &wrapper));

        let outcome = tokio::select! {
            result = &mut upload => Some(result),
            () = cancel.cancelled() => None,
        };
        match outcome {
            Some(result) => result.map_err(|err| InstanceError::Ssh {
                message: err.to_string(),
            })?,
            None => {
                let _ = interrupt.shutdown(Shutdown::Both);
                let _ = upload.await;
                Err(Self::cancelled(cancel))
            }
        }
    }

    async fn run_script(
        &self,
        cancel: &JobCancellation,
        output: &LogWriter,
    ) -> Result<RunResult, InstanceError> {
        let (tcp, interrupt) = self.dial(cancel).await?;
        let access = self.ssh.clone();
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(16);
        let session = tokio::task::spawn_blocking(move || ssh::run_script(&access, tcp, chunk_tx));

        let mut dropping_output = false;
        let mut cancelled = false;
        loop {
            tokio::select! {
                chunk = chunk_rx.recv() => match chunk {
                    Some(bytes) => {
                        if dropping_output {
                            continue;
                        }
                        if let Err(err) = output.write(&bytes).await {
                            // Capped log; the script keeps running.
                            warn!(error = %err, "dropping further script output");
                            dropping_output = true;
                        }
                    }
                    None => break,
                },
                () = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            // Fail any blocked session read, unblock a pending send, and
            // wait the helper out before reporting the cancellation.
            let _ = interrupt.shutdown(Shutdown::Both);
            drop(chunk_rx);
            let _ = session.await;
            return Err(Self::cancelled(cancel));
        }

        match session.await {
            Ok(result) => result,
            Err(err) => Err(InstanceError::Ssh {
                message: err.to_string(),
            }),
        }
    }

    async fn stop(&self) -> Result<(), InstanceError> {
        let Some(payload) = &self.payload else {
            return Ok(());
        };
        self.api
            .delete_instance(&payload.id)
            .await
            .map_err(|err| match err {
                ProviderError::Api { status, body } => InstanceError::Api { status, body },
                other => InstanceError::Http {
                    message: other.to_string(),
                },
            })
    }

    fn id(&self) -> String {
        match &self.payload {
            Some(payload) => format!(
                "{}:{}",
                payload.id,
                payload.base_image.clone().unwrap_or_default()
            ),
            None => String::from("{unidentified}"),
        }
    }
}
