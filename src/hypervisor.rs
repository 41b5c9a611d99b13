//! Hypervisor capabilities the daemon depends on.
//!
//! The scanner only needs to enumerate machines and read adapter addresses,
//! the listener only needs to power machines on. Both are traits so the core
//! can run against fakes; `CommandHypervisor` is the real implementation and
//! shells out to configurable command templates (Hyper-V PowerShell by
//! default).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::runtime::Runtime;

use crate::config::HypervisorConfig;
use crate::error::HypervisorError;

/// Placeholder substituted with the VM name in command templates.
pub const NAME_PLACEHOLDER: &str = "{name}";
/// Placeholder inside a single-quoted string literal, the way the default
/// PowerShell templates write it.
const QUOTED_PLACEHOLDER: &str = "'{name}'";

pub trait InventoryProvider {
    /// Names of every VM currently defined on the host.
    fn vm_names(&self) -> Result<Vec<String>, HypervisorError>;

    /// Raw adapter MAC of `vm` as reported by the hypervisor.
    fn adapter_mac(&self, vm: &str) -> Result<String, HypervisorError>;
}

pub trait PowerController: Send + Sync {
    /// Starts `vm`. Starting a running VM must succeed without effect.
    fn power_on(&self, vm: &str, timeout: Duration) -> Result<(), HypervisorError>;
}

impl<T: PowerController + ?Sized> PowerController for Arc<T> {
    fn power_on(&self, vm: &str, timeout: Duration) -> Result<(), HypervisorError> {
        (**self).power_on(vm, timeout)
    }
}

pub struct CommandHypervisor {
    cfg: HypervisorConfig,
    runtime: Runtime,
}

impl CommandHypervisor {
    pub fn new(cfg: HypervisorConfig) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { cfg, runtime })
    }

    fn run(&self, template: &str, vm: Option<&str>, timeout: Duration) -> Result<String, HypervisorError> {
        let argv = render_template(template, vm)?;
        let command = argv.join(" ");
        log::trace!("running '{}'", command);

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match self.runtime.block_on(async { tokio::time::timeout(timeout, cmd.output()).await }) {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(HypervisorError::Spawn { command, source }),
            Err(_) => return Err(HypervisorError::Timeout { command, timeout }),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::Failed {
                command,
                status: output.status.to_string(),
                output: format!("{} {}", stdout.trim(), stderr.trim()).trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

impl InventoryProvider for CommandHypervisor {
    fn vm_names(&self) -> Result<Vec<String>, HypervisorError> {
        let out = self.run(&self.cfg.list_vms, None, self.cfg.timeout())?;
        Ok(split_names(&out))
    }

    fn adapter_mac(&self, vm: &str) -> Result<String, HypervisorError> {
        self.run(&self.cfg.adapter_mac, Some(vm), self.cfg.timeout())
    }
}

impl PowerController for CommandHypervisor {
    fn power_on(&self, vm: &str, timeout: Duration) -> Result<(), HypervisorError> {
        self.run(&self.cfg.power_on, Some(vm), timeout).map(|_| ())
    }
}

/// Splits a template into argv and substitutes the VM name per argument, so
/// names containing spaces stay a single argument. A placeholder wrapped in
/// single quotes gets the name as a quoted literal, with its quotes doubled.
pub fn render_template(template: &str, vm: Option<&str>) -> Result<Vec<String>, HypervisorError> {
    let words = shell_words::split(template)
        .map_err(|_| HypervisorError::BadTemplate(template.to_string()))?;
    if words.is_empty() {
        return Err(HypervisorError::BadTemplate(template.to_string()));
    }

    Ok(words
        .into_iter()
        .map(|w| match vm {
            Some(name) => {
                let quoted = format!("'{}'", quote_literal(name));
                w.split(QUOTED_PLACEHOLDER)
                    .map(|part| part.replace(NAME_PLACEHOLDER, name))
                    .collect::<Vec<_>>()
                    .join(&quoted)
            }
            None => w,
        })
        .collect())
}

/// Doubles every single quote in `name`. PowerShell also closes a literal on
/// the typographic single quotes, so those are doubled as well.
fn quote_literal(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}') {
            out.push(c);
        }
        out.push(c);
    }
    out
}

/// VM names come back one per line or comma separated.
fn split_names(output: &str) -> Vec<String> {
    output
        .split(|c: char| c == '\n' || c == ',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
