//! NV device backed by the `tpm2-tools` command-line suite.
//!
//! Each [`NvDevice`] call runs one tool and parses its output. Reports are
//! YAML; they are checked against the fields this crate needs and rejected
//! with [`Error::Report`] when something is missing.

use super::{DefineRequest, DeviceLimits, NvDevice, SlotMetadata};
use crate::error::{Error, Result};
use crate::store::NvIndex;
use log::{debug, warn};
use serde_yaml::Value;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Fixed property holding the maximum NV index size.
const PT_NV_INDEX_MAX: &str = "TPM2_PT_NV_INDEX_MAX";

/// Fixed property holding the maximum NV read/write buffer.
const PT_NV_BUFFER_MAX: &str = "TPM2_PT_NV_BUFFER_MAX";

/// Environment variable tpm2-tools reads the TCTI configuration from.
const TCTI_ENV: &str = "TPM2TOOLS_TCTI";

/// Diagnostic fragments tpm2-tools prints for rejected authorization values.
const AUTH_FAILURE_MARKERS: [&str; 4] = [
    "authorization failure",
    "TPM_RC_AUTH_FAIL",
    "TPM_RC_BAD_AUTH",
    "0x98e",
];

/// [`NvDevice`] that shells out to `tpm2-tools`.
#[derive(Debug, Clone, Default)]
pub struct Tpm2ToolsDevice {
    /// Directory holding the tool binaries; `PATH` lookup when unset.
    tools_dir: Option<PathBuf>,
    /// TCTI string forwarded to every tool.
    tcti: Option<String>,
}

impl Tpm2ToolsDevice {
    /// Use tools found on `PATH` and their default TCTI.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look the tools up in `dir` instead of `PATH`.
    pub fn with_tools_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tools_dir = Some(dir.into());
        self
    }

    /// Talk to the TPM through the given TCTI (e.g. `device:/dev/tpmrm0`).
    pub fn with_tcti(mut self, tcti: impl Into<String>) -> Self {
        self.tcti = Some(tcti.into());
        self
    }

    fn program(&self, tool: &str) -> PathBuf {
        match &self.tools_dir {
            Some(dir) => dir.join(tool),
            None => PathBuf::from(tool),
        }
    }

    /// Run a tool and return its stdout.
    fn run(&self, tool: &str, args: &[String], input: Option<&[u8]>) -> Result<Vec<u8>> {
        let description = describe(tool, args);
        debug!("running {}", description);

        let mut command = Command::new(self.program(tool));
        command
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(tcti) = &self.tcti {
            command.env(TCTI_ENV, tcti);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::device(&description, format!("failed to start: {}", e)))?;

        // A tool may exit before draining its input; its status and stderr
        // are still collected so the failure is reported as the tool saw it.
        let input_error = match input {
            Some(data) => child
                .stdin
                .take()
                .and_then(|mut stdin| stdin.write_all(data).err()),
            None => None,
        };

        let output = child
            .wait_with_output()
            .map_err(|e| Error::device(&description, e.to_string()))?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            let status = match output.status.code() {
                Some(code) => format!("exit {}", code),
                None => "terminated by signal".to_string(),
            };
            let mut diagnostic = format!("{}: {}", status, stderr);
            if let Some(e) = &input_error {
                diagnostic.push_str(&format!(" (input not fully sent: {})", e));
            }
            return Err(Error::device(description, diagnostic));
        }
        if let Some(e) = input_error {
            return Err(Error::device(description, format!("failed to send input: {}", e)));
        }
        if !stderr.is_empty() {
            warn!("{} wrote to stderr: {}", description, stderr);
        }

        Ok(output.stdout)
    }

    /// Run a tool whose stdout is a YAML report.
    fn run_yaml(&self, tool: &str, args: &[String]) -> Result<Value> {
        let stdout = self.run(tool, args, None)?;
        parse_yaml(&describe(tool, args), &stdout)
    }

    /// Run a tool that authorizes with an index's auth value, mapping
    /// authorization failures to [`Error::Authentication`].
    fn run_authorized(
        &self,
        index: NvIndex,
        tool: &str,
        args: &[String],
        input: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        self.run(tool, args, input).map_err(|e| match e {
            Error::DeviceCommand { diagnostic, .. } if is_auth_failure(&diagnostic) => {
                Error::Authentication { index, diagnostic }
            }
            other => other,
        })
    }
}

impl NvDevice for Tpm2ToolsDevice {
    fn get_random(&mut self, n: usize) -> Result<Vec<u8>> {
        let args = vec!["--hex".to_string(), n.to_string()];
        let stdout = self.run("tpm2_getrandom", &args, None)?;
        let text = String::from_utf8_lossy(&stdout);
        hex::decode(text.trim())
            .map_err(|e| Error::report(describe("tpm2_getrandom", &args), e.to_string()))
    }

    fn list_indices(&mut self) -> Result<BTreeSet<NvIndex>> {
        let args = vec!["handles-nv-index".to_string()];
        let report = self.run_yaml("tpm2_getcap", &args)?;
        parse_index_list(&describe("tpm2_getcap", &args), &report)
    }

    fn read_public(&mut self, index: NvIndex) -> Result<SlotMetadata> {
        let args = vec![index.to_string()];
        let report = self.run_yaml("tpm2_nvreadpublic", &args)?;
        parse_public(&describe("tpm2_nvreadpublic", &args), index, &report)
    }

    fn read(&mut self, index: NvIndex, size: u32, auth: Option<&str>) -> Result<Vec<u8>> {
        let mut args = vec![
            "-C".to_string(),
            index.to_string(),
            "-s".to_string(),
            size.to_string(),
        ];
        push_auth(&mut args, "-P", auth);
        args.push(index.to_string());

        let data = self.run_authorized(index, "tpm2_nvread", &args, None)?;
        if data.len() != size as usize {
            return Err(Error::device(
                describe("tpm2_nvread", &args),
                format!("expected {} bytes, got {}", size, data.len()),
            ));
        }
        Ok(data)
    }

    fn define(&mut self, request: &DefineRequest<'_>) -> Result<NvIndex> {
        let mut args = vec![
            "-C".to_string(),
            request.hierarchy.to_string(),
            "-s".to_string(),
            request.size.to_string(),
            "-a".to_string(),
            request.attributes.join("|"),
        ];
        push_auth(&mut args, "-p", request.auth);
        args.push(request.index.to_string());

        let report = self.run_yaml("tpm2_nvdefine", &args)?;
        let command = describe("tpm2_nvdefine", &args);
        report
            .get("nv-index")
            .and_then(yaml_u32)
            .map(NvIndex)
            .ok_or_else(|| Error::report(command, "missing `nv-index` in response"))
    }

    fn write(&mut self, index: NvIndex, data: &[u8], auth: Option<&str>) -> Result<()> {
        let mut args = vec!["-C".to_string(), index.to_string()];
        push_auth(&mut args, "-P", auth);
        args.extend(["-i".to_string(), "-".to_string(), index.to_string()]);

        self.run_authorized(index, "tpm2_nvwrite", &args, Some(data))?;
        Ok(())
    }

    fn undefine(&mut self, index: NvIndex, hierarchy: &str, auth: Option<&str>) -> Result<()> {
        let mut args = vec!["-C".to_string(), hierarchy.to_string()];
        push_auth(&mut args, "-P", auth);
        args.push(index.to_string());

        self.run_authorized(index, "tpm2_nvundefine", &args, None)?;
        Ok(())
    }

    fn fixed_properties(&mut self) -> Result<DeviceLimits> {
        let args = vec!["properties-fixed".to_string()];
        let report = self.run_yaml("tpm2_getcap", &args)?;
        parse_limits(&describe("tpm2_getcap", &args), &report)
    }

    fn name(&self) -> &'static str {
        "tpm2-tools"
    }
}

/// Append an auth option. The `str:` prefix keeps passwords that look like
/// `hex:` or `file:` specifiers from being interpreted.
fn push_auth(args: &mut Vec<String>, flag: &str, auth: Option<&str>) {
    if let Some(auth) = auth {
        args.push(flag.to_string());
        args.push(format!("str:{}", auth));
    }
}

/// Printable command line with auth values masked.
fn describe(tool: &str, args: &[String]) -> String {
    let mut parts = vec![tool.to_string()];
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            parts.push("****".to_string());
            mask_next = false;
        } else {
            mask_next = arg == "-P" || arg == "-p";
            parts.push(arg.clone());
        }
    }
    parts.join(" ")
}

fn is_auth_failure(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    AUTH_FAILURE_MARKERS
        .iter()
        .any(|marker| lower.contains(&marker.to_ascii_lowercase()))
}

fn parse_yaml(command: &str, stdout: &[u8]) -> Result<Value> {
    let text = String::from_utf8_lossy(stdout);
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_yaml::from_str(&text).map_err(|e| Error::report(command, e.to_string()))
}

/// Integer from a YAML scalar; tpm2-tools prints most of them in hex.
fn yaml_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse::<NvIndex>().ok().map(NvIndex::value),
        _ => None,
    }
}

fn parse_index_list(command: &str, report: &Value) -> Result<BTreeSet<NvIndex>> {
    match report {
        Value::Null => Ok(BTreeSet::new()),
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                yaml_u32(item)
                    .map(NvIndex)
                    .ok_or_else(|| Error::report(command, format!("not an NV index: {:?}", item)))
            })
            .collect(),
        other => Err(Error::report(command, format!("expected a list, got {:?}", other))),
    }
}

fn parse_public(command: &str, index: NvIndex, report: &Value) -> Result<SlotMetadata> {
    let entries = report
        .as_mapping()
        .ok_or_else(|| Error::report(command, "expected a mapping keyed by NV index"))?;
    let public = entries
        .iter()
        .find(|(key, _)| yaml_u32(key) == Some(index.value()))
        .map(|(_, public)| public)
        .ok_or_else(|| Error::report(command, format!("no entry for {}", index)))?;

    let size = public
        .get("size")
        .and_then(yaml_u32)
        .ok_or_else(|| Error::report(command, "missing `size`"))?;
    let attributes = public
        .get("attributes")
        .and_then(|a| a.get("friendly"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::report(command, "missing `attributes.friendly`"))?
        .split('|')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect();
    let name_alg = public
        .get("hash algorithm")
        .and_then(|h| h.get("friendly"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(SlotMetadata {
        index,
        size,
        attributes,
        name_alg,
    })
}

fn parse_limits(command: &str, report: &Value) -> Result<DeviceLimits> {
    let property = |name: &str| {
        report
            .get(name)
            .and_then(|p| p.get("raw"))
            .and_then(yaml_u32)
            .ok_or_else(|| Error::report(command, format!("missing `{}.raw`", name)))
    };

    Ok(DeviceLimits {
        max_value_size: property(PT_NV_INDEX_MAX)?,
        max_transfer_size: property(PT_NV_BUFFER_MAX)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OWNER_HIERARCHY, SLOT_ATTRIBUTES, USER_NV_LOW};
    use crate::store::NvStore;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::{Mutex, MutexGuard};
    use tempfile::TempDir;

    fn yaml(text: &str) -> Value {
        parse_yaml("test", text.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_index_list() {
        let report = yaml("- 0x1400001\n- 0x1800000\n- 0x1800013\n");
        let indices = parse_index_list("test", &report).unwrap();
        let expected: BTreeSet<NvIndex> = [0x0140_0001, 0x0180_0000, 0x0180_0013]
            .into_iter()
            .map(NvIndex)
            .collect();
        assert_eq!(indices, expected);
    }

    #[test]
    fn test_parse_empty_index_list() {
        let report = yaml("");
        assert!(parse_index_list("test", &report).unwrap().is_empty());
    }

    #[test]
    fn test_parse_public() {
        let report = yaml(
            "0x1800000:\n  name: 000b1234\n  hash algorithm:\n    friendly: sha256\n    value: 0xB\n  attributes:\n    friendly: authwrite|authread|no_da|orderly\n    value: 0x2000C0C\n  size: 11\n",
        );
        let public = parse_public("test", NvIndex(0x0180_0000), &report).unwrap();
        assert_eq!(public.size, 11);
        assert!(public.attributes.contains("no_da"));
        assert!(public.attributes.contains("orderly"));
        assert_eq!(public.attributes.len(), 4);
        assert_eq!(public.name_alg.as_deref(), Some("sha256"));
    }

    #[test]
    fn test_parse_public_rejects_missing_size() {
        let report = yaml("0x1800000:\n  attributes:\n    friendly: authread\n");
        let result = parse_public("test", NvIndex(0x0180_0000), &report);
        assert!(matches!(result, Err(Error::Report { .. })));
    }

    #[test]
    fn test_parse_limits() {
        let report = yaml(
            "TPM2_PT_NV_INDEX_MAX:\n  raw: 0x800\nTPM2_PT_NV_BUFFER_MAX:\n  raw: 0x400\n",
        );
        let limits = parse_limits("test", &report).unwrap();
        assert_eq!(limits.max_value_size, 0x800);
        assert_eq!(limits.max_transfer_size, 0x400);
    }

    #[test]
    fn test_parse_limits_requires_both_properties() {
        let report = yaml("TPM2_PT_NV_INDEX_MAX:\n  raw: 0x800\n");
        assert!(matches!(parse_limits("test", &report), Err(Error::Report { .. })));
    }

    #[test]
    fn test_describe_masks_auth() {
        let mut args = vec!["-C".to_string(), "0x1800000".to_string()];
        push_auth(&mut args, "-P", Some("hunter2"));
        args.push("0x1800000".to_string());

        assert_eq!(args[3], "str:hunter2");
        let shown = describe("tpm2_nvread", &args);
        assert!(!shown.contains("hunter2"));
        assert_eq!(shown, "tpm2_nvread -C 0x1800000 -P **** 0x1800000");
    }

    #[test]
    fn test_auth_failure_detection() {
        assert!(is_auth_failure(
            "ERROR: Esys_NV_Read(0x9A2) - tpm:session(1):authorization failure without DA implications"
        ));
        assert!(!is_auth_failure("ERROR: Esys_NV_Read(0x14B) - tpm:error(2.0): the NV index is not defined"));
    }

    #[test]
    fn test_missing_tool_is_device_error() {
        let _guard = spawn_lock();
        let mut device = Tpm2ToolsDevice::new().with_tools_dir("/nonexistent/tpm2-tools");
        assert!(matches!(device.list_indices(), Err(Error::DeviceCommand { .. })));
    }

    /// Serializes tests that spawn processes. Writing a script while another
    /// thread forks can leave the file open in the child and fail the exec
    /// with "text file busy".
    fn spawn_lock() -> MutexGuard<'static, ()> {
        static LOCK: Mutex<()> = Mutex::new(());
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install an executable shell script named `tool` in `dir`.
    fn fake_tool(dir: &Path, tool: &str, body: &str) {
        let path = dir.join(tool);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Fake `tpm2_getcap` reporting 2048/1024 limits and no defined indices.
    fn fake_getcap(dir: &Path) {
        fake_tool(
            dir,
            "tpm2_getcap",
            r#"case "$1" in
  properties-fixed)
    printf 'TPM2_PT_NV_INDEX_MAX:\n  raw: 0x800\nTPM2_PT_NV_BUFFER_MAX:\n  raw: 0x400\n' ;;
  handles-nv-index)
    ;;
  *)
    exit 1 ;;
esac"#,
        );
    }

    #[test]
    fn test_define_reporting_other_index_is_mismatch() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        fake_getcap(dir.path());
        fake_tool(dir.path(), "tpm2_nvdefine", "echo 'nv-index: 0x1800001'");

        let device = Tpm2ToolsDevice::new().with_tools_dir(dir.path());
        let mut store = NvStore::new(device);
        let err = store
            .allocate_and_write(NvIndex(USER_NV_LOW), b"hello", None)
            .unwrap_err();

        assert!(matches!(
            err,
            Error::AllocationMismatch {
                requested: NvIndex(USER_NV_LOW),
                reported: NvIndex(0x0180_0001),
            }
        ));
        assert_eq!(err.orphaned_index(), Some(NvIndex(USER_NV_LOW)));
    }

    #[test]
    fn test_define_without_index_in_report() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        fake_tool(dir.path(), "tpm2_nvdefine", "echo 'size: 5'");

        let mut device = Tpm2ToolsDevice::new().with_tools_dir(dir.path());
        let result = device.define(&DefineRequest {
            index: NvIndex(USER_NV_LOW),
            size: 5,
            attributes: &SLOT_ATTRIBUTES,
            hierarchy: OWNER_HIERARCHY,
            auth: None,
        });
        assert!(matches!(result, Err(Error::Report { .. })));
    }

    #[test]
    fn test_rejected_password_is_authentication_error() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        fake_tool(
            dir.path(),
            "tpm2_nvread",
            "echo 'ERROR: Esys_NV_Read(0x9A2) - tpm:session(1):authorization failure without DA implications' >&2\nexit 1",
        );

        let mut device = Tpm2ToolsDevice::new().with_tools_dir(dir.path());
        match device.read(NvIndex(USER_NV_LOW), 5, Some("wrong")) {
            Err(Error::Authentication { index, diagnostic }) => {
                assert_eq!(index, NvIndex(USER_NV_LOW));
                assert!(diagnostic.starts_with("exit 1"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_other_tool_failure_stays_device_error() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        fake_tool(
            dir.path(),
            "tpm2_nvundefine",
            "echo 'ERROR: Esys_NV_UndefineSpace(0x18B) - tpm:handle(1):the handle is not correct for the use' >&2\nexit 1",
        );

        let mut device = Tpm2ToolsDevice::new().with_tools_dir(dir.path());
        let result = device.undefine(NvIndex(USER_NV_LOW), OWNER_HIERARCHY, None);
        assert!(matches!(result, Err(Error::DeviceCommand { .. })));
    }

    #[test]
    fn test_write_sends_value_on_stdin() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        fake_tool(
            dir.path(),
            "tpm2_nvwrite",
            r#"here=$(dirname "$0")
echo "$@" > "$here/args.txt"
cat > "$here/value.bin""#,
        );

        let value = [0x00, 0xFF, b'h', b'i', b'\n', 0x7F];
        let mut device = Tpm2ToolsDevice::new().with_tools_dir(dir.path());
        device.write(NvIndex(USER_NV_LOW), &value, Some("abcde")).unwrap();

        assert_eq!(std::fs::read(dir.path().join("value.bin")).unwrap(), value);
        let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert_eq!(args.trim(), "-C 0x1800000 -P str:abcde -i - 0x1800000");
    }

    #[test]
    fn test_tool_exiting_before_reading_input() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        fake_tool(
            dir.path(),
            "tpm2_nvwrite",
            "echo 'ERROR: Esys_NV_Write(0x98E) - tpm:session(1):the authorization HMAC check failed and DA counter incremented' >&2\nexit 1",
        );

        // Larger than a pipe buffer, so the write cannot finish before the tool exits.
        let value = vec![0xA5u8; 1 << 20];
        let mut device = Tpm2ToolsDevice::new().with_tools_dir(dir.path());
        match device.write(NvIndex(USER_NV_LOW), &value, Some("wrong")) {
            Err(Error::Authentication { diagnostic, .. }) => {
                assert!(diagnostic.starts_with("exit 1"));
                assert!(diagnostic.contains("0x98E"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_short_read_is_device_error() {
        let _guard = spawn_lock();
        let dir = TempDir::new().unwrap();
        fake_tool(dir.path(), "tpm2_nvread", "printf 'abc'");

        let mut device = Tpm2ToolsDevice::new().with_tools_dir(dir.path());
        match device.read(NvIndex(USER_NV_LOW), 5, None) {
            Err(Error::DeviceCommand { diagnostic, .. }) => {
                assert_eq!(diagnostic, "expected 5 bytes, got 3");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
