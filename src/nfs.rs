//! NFS export management.
//!
//! Grounded on `examples/original_source/targetd/nfs.py`: the bitmask
//! option set, `exportfs -v` parsing, mutually-exclusive option-pair
//! validation, and the managed-file rewrite that keeps
//! `/etc/exports.d/targetd.exports` in sync while excluding anything
//! the administrator already listed by hand in `/etc/exports`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use regex::Regex;
use tokio::fs;
use tracing::warn;

use crate::error::{Result, TargetdError};
use crate::util::invoke_raw;

// Boolean export option bits, mirroring `Export`'s class constants.
// Plain `u32` consts rather than a `bitflags!` type: the crate only
// ever needs the bit values plus the name<->bit lookup tables below.
pub const SECURE: u32 = 0x0000_0001;
pub const RW: u32 = 0x0000_0002;
pub const RO: u32 = 0x0000_0004;
pub const SYNC: u32 = 0x0000_0008;
pub const ASYNC: u32 = 0x0000_0010;
pub const NO_WDELAY: u32 = 0x0000_0020;
pub const NOHIDE: u32 = 0x0000_0040;
pub const CROSS_MNT: u32 = 0x0000_0080;
pub const NO_SUBTREE_CHECK: u32 = 0x0000_0100;
pub const INSECURE_LOCKS: u32 = 0x0000_0200;
pub const ROOT_SQUASH: u32 = 0x0000_0400;
pub const NO_ROOT_SQUASH: u32 = 0x0000_0800;
pub const ALL_SQUASH: u32 = 0x0000_1000;
pub const WDELAY: u32 = 0x0000_2000;
pub const HIDE: u32 = 0x0000_4000;
pub const INSECURE: u32 = 0x0000_8000;

/// Option name -> bit, mirroring `Export.bool_option`.
pub(crate) fn bool_option(name: &str) -> Option<u32> {
    Some(match name {
        "secure" => SECURE,
        "rw" => RW,
        "ro" => RO,
        "sync" => SYNC,
        "async" => ASYNC,
        "no_wdelay" => NO_WDELAY,
        "nohide" => NOHIDE,
        "cross_mnt" => CROSS_MNT,
        "no_subtree_check" => NO_SUBTREE_CHECK,
        "insecure_locks" => INSECURE_LOCKS,
        "root_squash" => ROOT_SQUASH,
        "no_root_squash" => NO_ROOT_SQUASH,
        "all_squash" => ALL_SQUASH,
        "wdelay" => WDELAY,
        "hide" => HIDE,
        "insecure" => INSECURE,
        _ => return None,
    })
}

fn bit_name(bit: u32) -> &'static str {
    match bit {
        SECURE => "secure",
        RW => "rw",
        RO => "ro",
        SYNC => "sync",
        ASYNC => "async",
        NO_WDELAY => "no_wdelay",
        NOHIDE => "nohide",
        CROSS_MNT => "cross_mnt",
        NO_SUBTREE_CHECK => "no_subtree_check",
        INSECURE_LOCKS => "insecure_locks",
        ROOT_SQUASH => "root_squash",
        NO_ROOT_SQUASH => "no_root_squash",
        ALL_SQUASH => "all_squash",
        WDELAY => "wdelay",
        HIDE => "hide",
        INSECURE => "insecure",
        _ => unreachable!("bit_name called with a non-power-of-two or unknown bit"),
    }
}

const ALL_BITS: &[u32] = &[
    SECURE, RW, RO, SYNC, ASYNC, NO_WDELAY, NOHIDE, CROSS_MNT, NO_SUBTREE_CHECK,
    INSECURE_LOCKS, ROOT_SQUASH, NO_ROOT_SQUASH, ALL_SQUASH, WDELAY, HIDE, INSECURE,
];

fn validate_options(options: u32) -> Result<u32> {
    let pair_set = |a: u32, b: u32| (options & (a | b)).count_ones() == 2;
    if pair_set(RW, RO) {
        return Err(TargetdError::InvalidArgument("both ro & rw set".into()));
    }
    if pair_set(INSECURE, SECURE) {
        return Err(TargetdError::InvalidArgument("both insecure & secure set".into()));
    }
    if pair_set(SYNC, ASYNC) {
        return Err(TargetdError::InvalidArgument("both sync & async set".into()));
    }
    if pair_set(HIDE, NOHIDE) {
        return Err(TargetdError::InvalidArgument("both hide & nohide set".into()));
    }
    if pair_set(WDELAY, NO_WDELAY) {
        return Err(TargetdError::InvalidArgument("both wdelay & no_wdelay set".into()));
    }
    if (options & (ROOT_SQUASH | NO_ROOT_SQUASH)).count_ones() > 1 {
        return Err(TargetdError::InvalidArgument(
            "only one of root_squash, no_root_squash can be specified".into(),
        ));
    }
    Ok(options)
}

/// A single NFS export: a path exposed to a host (or `*`) with a set
/// of boolean option bits plus `key=value` options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub host: String,
    pub path: String,
    pub options: u32,
    pub key_value_options: BTreeMap<String, String>,
}

impl Export {
    pub fn new(host: &str, path: &str, options: u32, key_value_options: BTreeMap<String, String>) -> Result<Self> {
        let host = if host == "<world>" { "*".to_string() } else { host.to_string() };
        Ok(Export {
            host,
            path: path.to_string(),
            options: validate_options(options)?,
            key_value_options,
        })
    }

    pub fn options_list(&self) -> Vec<String> {
        let mut rc: Vec<String> = ALL_BITS
            .iter()
            .filter(|&&bit| self.options & bit != 0)
            .map(|&bit| bit_name(bit).to_string())
            .collect();
        for (k, v) in &self.key_value_options {
            rc.push(format!("{k}={v}"));
        }
        rc
    }

    pub fn options_string(&self) -> String {
        self.options_list().join(",")
    }

    fn path_for_file(&self) -> String {
        if self.path.contains(' ') {
            format!("\"{}\"", self.path)
        } else {
            self.path.clone()
        }
    }

    pub fn export_file_format(&self) -> String {
        format!("{} {}({})\n", self.path_for_file(), self.host, self.options_string())
    }

    /// Parses `option_string` (`"rw,sync,anonuid=0"`) into bits + pairs.
    fn parse_opt(option_string: &str) -> Result<(u32, BTreeMap<String, String>)> {
        let mut bits = 0u32;
        let mut pairs = BTreeMap::new();
        if option_string.is_empty() {
            return Ok((bits, pairs));
        }
        for opt in option_string.split(',') {
            if let Some((k, v)) = opt.split_once('=') {
                pairs.insert(k.to_string(), v.to_string());
            } else {
                let Some(bit) = bool_option(opt) else {
                    return Err(TargetdError::InvalidArgument(format!("unknown export option '{opt}'")));
                };
                bits |= bit;
            }
        }
        Ok((bits, pairs))
    }

    /// Parses one `exportfs`-style config line already tokenized into
    /// whitespace-delimited fields (`path host1(opts) host2(opts) ...`),
    /// mirroring `parse_export`.
    fn parse_export_line(tokens: &[String]) -> Vec<Export> {
        if tokens.is_empty() {
            return Vec::new();
        }
        let path = tokens[0].clone();
        if tokens.len() == 1 {
            return match Export::new("*", &path, 0, BTreeMap::new()) {
                Ok(e) => vec![e],
                Err(_) => Vec::new(),
            };
        }

        let mut rc = Vec::new();
        let mut global_options = String::new();
        for t in &tokens[1..] {
            if t.starts_with('-') && global_options.is_empty() {
                global_options = t[1..].to_string();
                continue;
            }
            let (host, options) = if let Some(open) = t.find('(') {
                if !t.ends_with(')') {
                    continue;
                }
                if open == 0 {
                    ("*".to_string(), t[1..t.len() - 1].to_string())
                } else {
                    (t[..open].to_string(), t[open + 1..t.len() - 1].to_string())
                }
            } else {
                (t.clone(), String::new())
            };
            let combined = join_nonempty(',', &[&global_options, &options]);
            let Ok((bits, pairs)) = Export::parse_opt(&combined) else {
                continue;
            };
            if let Ok(export) = Export::new(&host, &path, bits, pairs) {
                rc.push(export);
            }
        }
        rc
    }

    /// Parses `exportfs -v` output, shaped `path  host(opts)` per line.
    pub fn parse_exportfs_output(text: &str) -> Vec<Export> {
        let re = Regex::new(r"([/a-zA-Z0-9.\-_]+)[\s]+(.+)\((.+)\)").expect("static regex is valid");
        let mut rc = Vec::new();
        for cap in re.captures_iter(text) {
            let path = &cap[1];
            let host = &cap[2];
            let opts = &cap[3];
            if let Ok((bits, pairs)) = Export::parse_opt(opts) {
                if let Ok(export) = Export::new(host, path, bits, pairs) {
                    rc.push(export);
                }
            }
        }
        rc
    }

    /// Parses the administrator-maintained `/etc/exports`, applying
    /// octal-escape decoding and shell-style tokenization before
    /// splitting into fields (mirrors `shlex.split` with `#` comments).
    pub fn parse_exports_file(contents: &str) -> Vec<Export> {
        let mut rc = Vec::new();
        for line in contents.lines() {
            let decoded = chr_encode(line);
            let tokens = shlex_split(&decoded, '#');
            rc.extend(Export::parse_export_line(&tokens));
        }
        rc
    }
}

fn join_nonempty(sep: char, parts: &[&str]) -> String {
    parts.iter().filter(|p| !p.is_empty()).cloned().collect::<Vec<_>>().join(&sep.to_string())
}

/// Replaces `\NNN` octal escapes (as `exportfs`/NFS use for paths
/// containing spaces) with the literal byte they encode.
fn chr_encode(s: &str) -> String {
    let re = Regex::new(r"\\([0-7][0-7][0-7])").expect("static regex is valid");
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for m in re.find_iter(s) {
        out.push_str(&s[last..m.start()]);
        let digits = &m.as_str()[1..];
        let code = u8::from_str_radix(digits, 8).unwrap_or(b'?');
        out.push(code as char);
        last = m.end();
    }
    out.push_str(&s[last..]);
    out
}

/// A narrow shell-word tokenizer: honors single/double quotes and
/// backslash escapes, and treats `comment_char` as starting a
/// to-end-of-line comment when it appears outside a quoted region.
fn shlex_split(s: &str, comment_char: char) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == comment_char {
            break;
        }
        match c {
            '\'' => {
                in_token = true;
                for c2 in chars.by_ref() {
                    if c2 == '\'' {
                        break;
                    }
                    current.push(c2);
                }
            }
            '"' => {
                in_token = true;
                while let Some(c2) = chars.next() {
                    if c2 == '"' {
                        break;
                    }
                    if c2 == '\\' {
                        if let Some(&next) = chars.peek() {
                            if next == '"' || next == '\\' {
                                current.push(chars.next().unwrap());
                                continue;
                            }
                        }
                    }
                    current.push(c2);
                }
            }
            '\\' => {
                in_token = true;
                if let Some(c2) = chars.next() {
                    current.push(c2);
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Manages NFS exports via `exportfs` and keeps the managed config
/// file in `/etc/exports.d` consistent with the kernel's live export
/// table.
pub struct NfsManager {
    exportfs_cmd: String,
    export_fs_config_dir: PathBuf,
    export_file_name: String,
    main_export_file: PathBuf,
}

impl Default for NfsManager {
    fn default() -> Self {
        NfsManager {
            exportfs_cmd: "exportfs".to_string(),
            export_fs_config_dir: PathBuf::from("/etc/exports.d"),
            export_file_name: "targetd.exports".to_string(),
            main_export_file: PathBuf::from("/etc/exports"),
        }
    }
}

impl NfsManager {
    pub fn security_options() -> &'static [&'static str] {
        &["sys", "krb5", "krb5i", "krb5p"]
    }

    pub async fn exports(&self) -> Result<Vec<Export>> {
        let inv = invoke_raw(&[&self.exportfs_cmd, "-v"]).await?;
        if inv.code != 0 {
            return Err(TargetdError::NfsNoSupport(format!(
                "exportfs -v exited {}: {}",
                inv.code, inv.stderr
            )));
        }
        Ok(Export::parse_exportfs_output(&inv.stdout))
    }

    pub async fn export_add(
        &self,
        host: &str,
        path: &str,
        bit_options: u32,
        key_value_options: BTreeMap<String, String>,
    ) -> Result<()> {
        let export = Export::new(host, path, bit_options, key_value_options)?;
        let options = export.options_string();

        let mut argv: Vec<&str> = vec![&self.exportfs_cmd];
        if !options.is_empty() {
            argv.push("-o");
            argv.push(&options);
        }
        let target = format!("{host}:{path}");
        argv.push(&target);

        let inv = invoke_raw(&argv).await?;
        match inv.code {
            0 => {
                self.save_exports().await?;
                Ok(())
            }
            22 => Err(TargetdError::InvalidArgument(format!("invalid export option: {}", inv.stderr))),
            code => Err(TargetdError::UnexpectedExitCode {
                cmd: argv.iter().map(|s| s.to_string()).collect(),
                code,
                output: format!("{}{}", inv.stdout, inv.stderr),
            }),
        }
    }

    pub async fn export_remove(&self, host: &str, path: &str) -> Result<()> {
        let exports = self.exports().await?;
        let mut found = false;
        for e in exports.into_iter().filter(|e| e.host == host && e.path == path) {
            let target = format!("{}:{}", e.host, e.path);
            let inv = invoke_raw(&[&self.exportfs_cmd, "-u", &target]).await?;
            if inv.code == 0 {
                found = true;
                self.save_exports().await?;
            }
        }
        if !found {
            return Err(TargetdError::NotFoundNfsExport {
                host: host.to_string(),
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Rewrites the managed export file from the live `exportfs -v`
    /// table, skipping anything the administrator already declared by
    /// hand in `/etc/exports`.
    async fn save_exports(&self) -> Result<()> {
        let config_file = self.export_fs_config_dir.join(&self.export_file_name);
        let _ = fs::remove_file(&config_file).await;

        let user_exports = match fs::read_to_string(&self.main_export_file).await {
            Ok(contents) => Export::parse_exports_file(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(error = %e, "unable to read /etc/exports while rewriting managed export file");
                Vec::new()
            }
        };

        let mut body = String::new();
        for e in self.exports().await? {
            if !user_exports.iter().any(|u| u.path == e.path && u.host == e.host) {
                body.push_str(&e.export_file_format());
            }
        }
        fs::write(&config_file, body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_options_rejects_ro_and_rw() {
        assert!(validate_options(RO | RW).is_err());
    }

    #[test]
    fn validate_options_allows_rw_with_sync() {
        assert!(validate_options(RW | SYNC).is_ok());
    }

    #[test]
    fn parse_opt_splits_bits_and_pairs() {
        let (bits, pairs) = Export::parse_opt("rw,sync,anonuid=0").unwrap();
        assert_eq!(bits, RW | SYNC);
        assert_eq!(pairs.get("anonuid"), Some(&"0".to_string()));
    }

    #[test]
    fn world_host_normalizes_to_star() {
        let e = Export::new("<world>", "/data", RO, BTreeMap::new()).unwrap();
        assert_eq!(e.host, "*");
    }

    #[test]
    fn parse_exportfs_output_extracts_host_and_options() {
        let out = "/export/foo\t192.168.1.0/24(ro,sync,wdelay)\n";
        let exports = Export::parse_exportfs_output(out);
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].path, "/export/foo");
        assert_eq!(exports[0].host, "192.168.1.0/24");
        assert_eq!(exports[0].options, RO | SYNC | WDELAY);
    }

    #[test]
    fn chr_encode_decodes_octal_space() {
        assert_eq!(chr_encode(r"/exp\040ort"), "/exp ort");
    }

    #[test]
    fn shlex_split_handles_quoted_path_with_space() {
        let tokens = shlex_split(r#""/my export" 10.0.0.0/24(rw)"#, '#');
        assert_eq!(tokens, vec!["/my export".to_string(), "10.0.0.0/24(rw)".to_string()]);
    }

    #[test]
    fn shlex_split_strips_comments() {
        let tokens = shlex_split("/data host(rw) # a comment", '#');
        assert_eq!(tokens, vec!["/data".to_string(), "host(rw)".to_string()]);
    }

    #[test]
    fn export_file_format_quotes_paths_with_spaces() {
        let e = Export::new("*", "/my export", RO, BTreeMap::new()).unwrap();
        assert_eq!(e.export_file_format(), "\"/my export\" *(ro)\n");
    }
}
