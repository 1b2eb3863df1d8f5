//! Scripted command runner shared by the workflow tests.
//!
//! Commands are matched by the prefix of their command line. Anything
//! without a rule succeeds with empty output.

#![allow(dead_code)]

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use archzfs::command::{CommandOutput, CommandRunner, Invocation};
use archzfs::error::CommandFailure;
use archzfs::plan::{PlanConfig, Secret};

pub const GIB: u64 = 1024 * 1024 * 1024;

type Responder = Box<dyn Fn(&Invocation) -> Result<CommandOutput, CommandFailure>>;

struct Rule {
    prefix: String,
    respond: Responder,
    remaining: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub line: String,
    pub stdin: Option<String>,
}

#[derive(Default)]
pub struct FakeRunner {
    rules: RefCell<Vec<Rule>>,
    calls: RefCell<Vec<Call>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix`. Later rules win.
    pub fn on<F>(self, prefix: impl Into<String>, respond: F) -> Self
    where
        F: Fn(&Invocation) -> Result<CommandOutput, CommandFailure> + 'static,
    {
        self.rules.borrow_mut().push(Rule {
            prefix: prefix.into(),
            respond: Box::new(respond),
            remaining: None,
        });
        self
    }

    /// Like [`FakeRunner::on`], but only for the next `times` matches.
    pub fn on_times<F>(self, prefix: impl Into<String>, times: usize, respond: F) -> Self
    where
        F: Fn(&Invocation) -> Result<CommandOutput, CommandFailure> + 'static,
    {
        self.rules.borrow_mut().push(Rule {
            prefix: prefix.into(),
            respond: Box::new(respond),
            remaining: Some(times),
        });
        self
    }

    pub fn respond(self, prefix: impl Into<String>, output: CommandOutput) -> Self {
        self.on(prefix, move |_| Ok(output.clone()))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.line.clone()).collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.line.starts_with(prefix))
            .count()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls
            .borrow()
            .iter()
            .position(|c| c.line.starts_with(prefix))
    }
}

impl CommandRunner for FakeRunner {
    fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, CommandFailure> {
        let line = invocation.command_line();
        self.calls.borrow_mut().push(Call {
            line: line.clone(),
            stdin: invocation.stdin().map(str::to_string),
        });

        let mut rules = self.rules.borrow_mut();
        for rule in rules.iter_mut().rev() {
            if !line.starts_with(&rule.prefix) || rule.remaining == Some(0) {
                continue;
            }
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            return (rule.respond)(invocation);
        }
        Ok(CommandOutput::ok(""))
    }
}

pub fn lsblk_json(disks: &[(&str, u64)]) -> String {
    let devices: Vec<String> = disks
        .iter()
        .map(|(path, size)| {
            format!(
                r#"{{"name":"{}","path":"{}","size":{},"model":"QEMU HARDDISK","type":"disk","ro":false,"pttype":null}}"#,
                path.trim_start_matches("/dev/"),
                path,
                size
            )
        })
        .collect();
    format!(r#"{{"blockdevices":[{}]}}"#, devices.join(","))
}

/// Default single-disk GRUB plan installing into `target`.
pub fn sample_plan(target: &Path) -> PlanConfig {
    let mut config = PlanConfig::new(vec![PathBuf::from("/dev/sdb")]);
    config.system.root_password = Secret::new("rootpw");
    config.target = target.to_path_buf();
    config.execution.bootstrap_backoff_secs = 0;
    config
}

/// A runner under which the default plan installs successfully.
pub fn installer_runner(target: &Path) -> FakeRunner {
    let grub_cfg = target.join("boot/grub/grub.cfg");
    let mkconfig = format!(
        "arch-chroot {} env ZPOOL_VDEV_NAME_PATH=1 grub-mkconfig",
        target.display()
    );

    FakeRunner::new()
        .respond("lsblk", CommandOutput::ok(lsblk_json(&[("/dev/sdb", 20 * GIB)])))
        .respond("blkid -p", CommandOutput::failed(2, ""))
        .respond("blkid -s UUID", CommandOutput::ok("ABCD-1234\n"))
        .respond("hostid", CommandOutput::ok("007f0101\n"))
        .respond(
            "efibootmgr",
            CommandOutput::ok("BootCurrent: 0001\nBootOrder: 0001\nBoot0001* GRUB\tHD(1,GPT)\n"),
        )
        .on(mkconfig, move |_| {
            if let Some(dir) = grub_cfg.parent() {
                fs::create_dir_all(dir).expect("create grub dir");
            }
            fs::write(
                &grub_cfg,
                "menuentry 'Arch Linux' {\n  linux /vmlinuz-linux-lts root=ZFS=rpool/ROOT/arch rw zfs=rpool/ROOT/arch\n}\n",
            )
            .expect("write grub.cfg");
            Ok(CommandOutput::ok(""))
        })
}
