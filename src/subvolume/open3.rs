//! Open3 implementation of [`SubvolumeEngine`](../trait.SubvolumeEngine.html).
//!
//! Easy way - [`BtrfsOpen3::default()`](struct.BtrfsOpen3.html#impl-Default).
//! It will look for `BTRFS_CMD` in current environment and fall back to
//! `btrfs` in `PATH`.
//!
//! It's called [open3](https://docs.ruby-lang.org/en/2.0.0/Open3.html) because it opens `stdin`, `stdout`, `stderr`.

use std::collections::BTreeSet;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use pest::Parser;
use regex::Regex;
use slog::Logger;

use super::ioctl;
use super::stream::{copy_one_stream, copy_stream};
use super::{CancelToken, Error, Qgroup, Result, SubvolumeEngine};
use crate::parsers::{BtrfsParser, Rule};
use crate::GlobalLogger;

lazy_static! {
    static ref VERSION_RE: Regex = Regex::new(r"v([0-9][0-9A-Za-z.\-]*)").unwrap();
}

/// Open3 implementation of [`SubvolumeEngine`](../trait.SubvolumeEngine.html).
/// You can use `BtrfsOpen3::default` to create it.
pub struct BtrfsOpen3 {
    cmd_name: OsString,
    logger: Logger,
}

impl Default for BtrfsOpen3 {
    /// Uses `log` crate as drain for `Slog`. Tries to use `BTRFS_CMD` from
    /// environment if variable is missing then it uses `btrfs` from `$PATH`.
    fn default() -> BtrfsOpen3 {
        let cmd_name = match env::var_os("BTRFS_CMD") {
            Some(val) => val,
            None => "btrfs".into(),
        };

        let logger = GlobalLogger::get()
            .new(o!("firn_module" => "subvolume", "subvolume_impl" => "open3"));
        BtrfsOpen3 { cmd_name, logger }
    }
}

impl BtrfsOpen3 {
    /// Create new using supplied path as btrfs cmd.
    pub fn with_cmd<I: Into<OsString>>(cmd_name: I) -> BtrfsOpen3 {
        let mut b = BtrfsOpen3::default();
        b.cmd_name = cmd_name.into();
        b
    }

    fn btrfs(&self) -> Command { Command::new(&self.cmd_name) }

    fn spawn_error(err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::NotFound {
            Error::CommandNotFound
        } else {
            Error::Io(err)
        }
    }

    fn run(&self, b: &mut Command, op: &str) -> Result<()> {
        debug!(self.logger, "executing"; "cmd" => format_args!("{:?}", b));
        let out = b.output().map_err(Self::spawn_error)?;
        if out.status.success() {
            Ok(())
        } else {
            Err(Error::from_stderr(op, &out.stderr))
        }
    }

    fn run_stdout(&self, b: &mut Command, op: &str) -> Result<String> {
        debug!(self.logger, "executing"; "cmd" => format_args!("{:?}", b));
        let out = b.output().map_err(Self::spawn_error)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        } else {
            Err(Error::from_stderr(op, &out.stderr))
        }
    }

    /// Version of the installed btrfs tooling, e.g. `6.6.3`. Probed once by
    /// drivers at construction to fail early on hosts without the tools.
    pub fn version(&self) -> Result<String> {
        let mut b = self.btrfs();
        b.arg("--version");
        let stdout = self.run_stdout(&mut b, "btrfs --version")?;
        VERSION_RE
            .captures(&stdout)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| Error::ParseError(stdout.trim().to_string()))
    }

    fn show(&self, path: &Path) -> Result<ShowFields> {
        let mut b = self.btrfs();
        b.arg("subvolume").arg("show").arg(path);
        let stdout = match self.run_stdout(&mut b, "btrfs subvolume show") {
            Ok(stdout) => stdout,
            Err(Error::CommandFailed(_, ref stderr))
                if stderr.contains("No such file")
                    || stderr.contains("not a subvolume")
                    || stderr.contains("Not a Btrfs subvolume") =>
            {
                return Err(Error::NotSubvolume(path.to_path_buf()));
            },
            Err(e) => return Err(e),
        };

        ShowFields::parse(&stdout)
    }

    fn qgroup_id(&self, path: &Path) -> Result<String> {
        Ok(format!("0/{}", self.subvolume_id(path)?))
    }
}

/// The fields of `btrfs subvolume show` this crate consumes.
struct ShowFields {
    /// Path of the subvolume relative to the filesystem root, `/` for the
    /// top level subvolume.
    top_path: String,
    uuid: String,
    received_uuid: Option<String>,
    id: u64,
}

impl ShowFields {
    fn parse(stdout: &str) -> Result<ShowFields> {
        let mut lines = stdout.lines();
        let top_path = lines
            .next()
            .ok_or_else(|| Error::ParseError("empty subvolume show output".to_string()))?
            .trim()
            .to_string();

        let mut uuid = String::new();
        let mut received_uuid = None;
        let mut id = None;

        for line in lines {
            let mut split = line.splitn(2, ':');
            let key = split.next().unwrap_or("").trim();
            let value = split.next().unwrap_or("").trim();
            match key {
                "UUID" => uuid = value.to_string(),
                "Received UUID" => {
                    received_uuid = match value {
                        "-" | "" => None,
                        v => Some(v.to_string()),
                    }
                },
                "Subvolume ID" => id = value.parse().ok(),
                _ => {},
            }
        }

        Ok(ShowFields {
            top_path,
            uuid,
            received_uuid,
            id: id.ok_or_else(|| {
                Error::ParseError("subvolume show output has no subvolume id".to_string())
            })?,
        })
    }
}

impl SubvolumeEngine for BtrfsOpen3 {
    fn logger(&self) -> &Logger { &self.logger }

    fn create(&self, path: &Path) -> Result<()> {
        let mut b = self.btrfs();
        b.arg("subvolume").arg("create").arg(path);
        self.run(&mut b, "btrfs subvolume create")
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let mut b = self.btrfs();
        b.arg("subvolume").arg("delete").arg(path);
        self.run(&mut b, "btrfs subvolume delete")
    }

    fn snapshot_one(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()> {
        let mut b = self.btrfs();
        b.arg("subvolume").arg("snapshot");
        if readonly {
            b.arg("-r");
        }
        b.arg(src).arg(dst);
        self.run(&mut b, "btrfs subvolume snapshot")
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        match self.show(path) {
            Ok(_) => Ok(true),
            Err(Error::NotSubvolume(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_readonly(&self, path: &Path) -> Result<bool> {
        let mut b = self.btrfs();
        b.arg("property").arg("get").arg("-ts").arg(path).arg("ro");
        let stdout = self.run_stdout(&mut b, "btrfs property get")?;
        match stdout.trim().splitn(2, '=').nth(1) {
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            _ => Err(Error::ParseError(stdout.trim().to_string())),
        }
    }

    fn set_readonly(&self, path: &Path, readonly: bool) -> Result<()> {
        let mut b = self.btrfs();
        b.arg("property")
            .arg("set")
            .arg("-ts")
            .arg(path)
            .arg("ro")
            .arg(if readonly { "true" } else { "false" });
        self.run(&mut b, "btrfs property set")
    }

    fn uuid(&self, path: &Path) -> Result<String> { Ok(self.show(path)?.uuid) }

    fn received_uuid(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.show(path)?.received_uuid)
    }

    fn set_received_uuid(&self, path: &Path, uuid: &str) -> Result<()> {
        debug!(self.logger, "imprinting received uuid";
               "path" => format_args!("{:?}", path), "uuid" => uuid);
        ioctl::set_received_uuid(path, uuid).map_err(Error::from)
    }

    fn subvolume_id(&self, path: &Path) -> Result<u64> { Ok(self.show(path)?.id) }

    fn list_subvolumes(&self, root: &Path) -> Result<Vec<(u64, String)>> {
        let top = self.show(root)?.top_path;
        let prefix = if top == "/" {
            String::new()
        } else {
            format!("{}/", top.trim_start_matches('/'))
        };

        let mut b = self.btrfs();
        b.arg("subvolume").arg("list").arg(root);
        let stdout = self.run_stdout(&mut b, "btrfs subvolume list")?;

        let pairs = BtrfsParser::parse(Rule::subvol_list, &stdout)
            .map_err(|_| Error::ParseError(stdout.clone()))?;

        let mut result = Vec::new();
        for line in pairs.flatten().filter(|p| p.as_rule() == Rule::subvol_line) {
            let mut inner = line.into_inner();
            let id = inner
                .next()
                .and_then(|p| p.as_str().parse::<u64>().ok())
                .ok_or_else(|| Error::ParseError(stdout.clone()))?;
            let path = inner
                .last()
                .map(|p| p.as_str().to_string())
                .ok_or_else(|| Error::ParseError(stdout.clone()))?;

            if let Some(rel) = path.strip_prefix(&prefix) {
                if !prefix.is_empty() || path != top {
                    result.push((id, rel.to_string()));
                }
            }
        }

        Ok(result)
    }

    fn set_nocow(&self, path: &Path) -> Result<()> {
        debug!(self.logger, "setting no-CoW attribute"; "path" => format_args!("{:?}", path));
        ioctl::set_nocow(path).map_err(Error::from)
    }

    fn send(
        &self,
        path: &Path,
        parent: Option<&Path>,
        out: &mut dyn Write,
        cancel: &CancelToken,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<()> {
        let mut b = self.btrfs();
        b.arg("send");
        if let Some(parent) = parent {
            b.arg("-p").arg(parent);
        }
        b.arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(self.logger, "executing"; "cmd" => format_args!("{:?}", b));
        let mut child = b.spawn().map_err(Self::spawn_error)?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ParseError("btrfs send has no stdout".to_string()))?;

        let copied = copy_stream(&mut stdout, out, cancel, progress);
        if copied.is_err() {
            let _ = child.kill();
        }
        let output = child.wait_with_output()?;
        copied?;

        if !output.status.success() {
            return Err(Error::from_stderr("btrfs send", &output.stderr));
        }
        Ok(())
    }

    fn receive(
        &self,
        dir: &Path,
        input: &mut dyn Read,
        cancel: &CancelToken,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<PathBuf> {
        let before: BTreeSet<_> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.file_name()))
            .collect();

        let mut b = self.btrfs();
        b.arg("receive")
            .arg("-e")
            .arg(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!(self.logger, "executing"; "cmd" => format_args!("{:?}", b));
        let mut child = b.spawn().map_err(Self::spawn_error)?;

        let copied = {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::ParseError("btrfs receive has no stdin".to_string()))?;
            copy_one_stream(input, &mut stdin, cancel, progress)
        };
        if copied.is_err() {
            let _ = child.kill();
        }
        let output = child.wait_with_output()?;
        copied?;

        if !output.status.success() {
            return Err(Error::from_stderr("btrfs receive", &output.stderr));
        }

        let mut fresh = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.file_name()))
            .filter(|name| !before.contains(name));

        let name = fresh
            .next()
            .ok_or_else(|| Error::ParseError("receive produced no subvolume".to_string()))?;
        if fresh.next().is_some() {
            return Err(Error::ParseError(
                "receive produced more than one subvolume".to_string(),
            ));
        }

        Ok(dir.join(name))
    }

    fn quota_enable(&self, path: &Path) -> Result<()> {
        let mut b = self.btrfs();
        b.arg("quota").arg("enable").arg(path);
        self.run(&mut b, "btrfs quota enable")
    }

    fn qgroup(&self, path: &Path) -> Result<Qgroup> {
        let mut b = self.btrfs();
        b.arg("qgroup").arg("show").arg("-re").arg("--raw").arg("-f").arg(path);
        let stdout = self.run_stdout(&mut b, "btrfs qgroup show")?;

        let pairs = BtrfsParser::parse(Rule::qgroup_table, &stdout)
            .map_err(|_| Error::ParseError(stdout.clone()))?;

        for row in pairs.flatten().filter(|p| p.as_rule() == Rule::qgroup_row) {
            let fields: Vec<_> = row.into_inner().map(|p| p.as_str().to_string()).collect();
            if fields.len() != 5 || !fields[0].starts_with("0/") {
                continue;
            }

            let parse = |v: &str| -> Result<u64> {
                v.parse().map_err(|_| Error::ParseError(stdout.clone()))
            };
            let parse_limit = |v: &str| -> Result<Option<u64>> {
                if v == "none" {
                    Ok(None)
                } else {
                    v.parse().map(Some).map_err(|_| Error::ParseError(stdout.clone()))
                }
            };

            return Ok(Qgroup::new(
                fields[0].clone(),
                parse(&fields[1])?,
                parse(&fields[2])?,
                parse_limit(&fields[3])?,
                parse_limit(&fields[4])?,
            ));
        }

        Err(Error::NoQgroup)
    }

    fn qgroup_create(&self, path: &Path) -> Result<()> {
        let id = self.qgroup_id(path)?;
        let mut b = self.btrfs();
        b.arg("qgroup").arg("create").arg(id).arg(path);
        self.run(&mut b, "btrfs qgroup create")
    }

    fn qgroup_destroy(&self, path: &Path) -> Result<()> {
        let id = self.qgroup_id(path)?;
        let mut b = self.btrfs();
        b.arg("qgroup").arg("destroy").arg(id).arg(path);
        self.run(&mut b, "btrfs qgroup destroy")
    }

    fn qgroup_limit_referenced(&self, path: &Path, limit: Option<u64>) -> Result<()> {
        let mut b = self.btrfs();
        b.arg("qgroup").arg("limit");
        match limit {
            Some(bytes) => b.arg(bytes.to_string()),
            None => b.arg("none"),
        };
        b.arg(path);
        self.run(&mut b, "btrfs qgroup limit")
    }

    fn qgroup_limit_exclusive(&self, path: &Path, limit: Option<u64>) -> Result<()> {
        let mut b = self.btrfs();
        b.arg("qgroup").arg("limit").arg("-e");
        match limit {
            Some(bytes) => b.arg(bytes.to_string()),
            None => b.arg("none"),
        };
        b.arg(path);
        self.run(&mut b, "btrfs qgroup limit")
    }
}
