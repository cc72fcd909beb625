//! Container environment assembly
//!
//! Path-like variables are additive: a new value is prefixed and the old one
//! kept, so `PATH=/a` extended with `/b` becomes `/b:/a`.

use super::mounts::InstallTarget;
use crate::Result;
use fclocal_config::{FunctionProps, NasConfig};
use std::path::Path;

/// Variables merged by prefixing instead of replacing
pub const PATH_KEYS: &[&str] = &["PATH", "LD_LIBRARY_PATH"];

/// Host variables holding the credentials passed to invoke/start containers
pub const ACCESS_KEY_ID_VAR: &str = "FCLOCAL_ACCESS_KEY_ID";
pub const ACCESS_KEY_SECRET_VAR: &str = "FCLOCAL_ACCESS_KEY_SECRET";

const FUN_ROOT: &str = "/code/.fun/root";

const SYSTEM_LIB_DIRS: &[&str] = &[
    "/usr/local/lib",
    "/usr/lib",
    "/usr/lib/x86_64-linux-gnu",
    "/usr/lib64",
    "/lib",
    "/lib/x86_64-linux-gnu",
    "/python/lib/python2.7/site-packages",
    "/python/lib/python3.6/site-packages",
];

const SYSTEM_BIN_DIRS: &[&str] = &[
    "/usr/local/bin",
    "/usr/local/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/sbin",
    "/bin",
];

const CODE_LIB_DIRS: &[&str] = &["/code", "/code/lib", "/usr/local/lib"];

const CODE_BIN_DIRS: &[&str] = &[
    "/code",
    "/code/node_modules/.bin",
    "/code/.fun/python/bin",
    "/code/.fun/node_modules/.bin",
];

/// Ordered `KEY=value` environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars(Vec<(String, String)>);

impl EnvVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a variable, keeping its position when it already exists
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn set_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if self.get(&key).is_none() {
            self.set(key, value);
        }
    }

    /// Prefix `value` to a `:`-separated variable
    pub fn prepend_path(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        let merged = match self.get(key) {
            Some(old) if !old.is_empty() => format!("{}:{}", value, old),
            _ => value.to_string(),
        };
        self.set(key, merged);
    }

    /// Merge another set on top: path keys are prefixed, others replaced
    pub fn merge(&mut self, other: EnvVars) {
        for (key, value) in other.0 {
            if PATH_KEYS.contains(&key.as_str()) {
                self.prepend_path(&key, &value);
            } else {
                self.set(key, value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<(String, String)> {
        self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = EnvVars::new();
        for (k, v) in iter {
            env.set(k, v);
        }
        env
    }
}

/// NAS mount directories inside the container, used for path extension
pub fn nas_mount_dirs(nas: Option<&NasConfig>) -> Vec<String> {
    match nas {
        Some(NasConfig::Auto(_)) => vec![super::mounts::AUTO_NAS_MOUNT_DIR.to_string()],
        Some(NasConfig::Explicit(settings)) => settings
            .mount_points
            .iter()
            .map(|mp| mp.mount_dir.clone())
            .collect(),
        None => Vec::new(),
    }
}

/// Search paths of the runtime image plus the `.fun` and NAS install dirs
pub fn runtime_paths(nas_dirs: &[String]) -> EnvVars {
    let mut lib_dirs: Vec<String> = SYSTEM_LIB_DIRS
        .iter()
        .map(|d| format!("{}{}", FUN_ROOT, d))
        .collect();
    lib_dirs.extend(CODE_LIB_DIRS.iter().map(|d| d.to_string()));

    let mut bin_dirs: Vec<String> = SYSTEM_BIN_DIRS
        .iter()
        .map(|d| format!("{}{}", FUN_ROOT, d))
        .collect();
    bin_dirs.extend(CODE_BIN_DIRS.iter().map(|d| d.to_string()));

    for dir in nas_dirs {
        bin_dirs.push(format!("{}/python/bin", dir));
        bin_dirs.push(format!("{}/node_modules/.bin", dir));
        bin_dirs.extend(SYSTEM_BIN_DIRS.iter().map(|d| format!("{}/root{}", dir, d)));
        lib_dirs.push(format!("{}/lib", dir));
        lib_dirs.extend(SYSTEM_LIB_DIRS.iter().map(|d| format!("{}/root{}", dir, d)));
    }
    bin_dirs.extend(SYSTEM_BIN_DIRS.iter().map(|d| d.to_string()));

    dedup(&mut lib_dirs);
    dedup(&mut bin_dirs);

    let mut env = EnvVars::new();
    env.set("LD_LIBRARY_PATH", lib_dirs.join(":"));
    env.set("PATH", bin_dirs.join(":"));
    env.set("PYTHONUSERBASE", "/code/.fun/python");
    env
}

fn dedup(dirs: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    dirs.retain(|d| seen.insert(d.clone()));
}

/// Merge runtime search paths into `env`; an existing `PYTHONUSERBASE` wins
pub fn with_runtime_paths(env: EnvVars, nas_dirs: &[String]) -> EnvVars {
    let mut additions = runtime_paths(nas_dirs);
    let mut merged = env;
    if let Some(base) = merged.get("PYTHONUSERBASE") {
        additions.set("PYTHONUSERBASE", base);
    }
    merged.merge(additions);
    merged
}

/// Search paths contributed by install targets
pub fn install_target_env(targets: &[InstallTarget]) -> EnvVars {
    let mut env = EnvVars::new();
    for target in targets.iter().rev() {
        let dir = target.container_path.trim_end_matches('/');
        env.prepend_path("PATH", &format!("{}/bin:{}/python/bin", dir, dir));
        env.prepend_path("LD_LIBRARY_PATH", &format!("{}/lib", dir));
    }
    if let Some(first) = targets.first() {
        env.set(
            "PYTHONUSERBASE",
            format!("{}/python", first.container_path.trim_end_matches('/')),
        );
    }
    env
}

/// Library dirs listed in `<code>/.fun/root/etc/ld.so.conf.d/*.conf`,
/// rewritten to their container location
pub fn ld_conf_lib_dirs(code_dir: &Path) -> Result<Vec<String>> {
    let conf_dir = code_dir.join(".fun/root/etc/ld.so.conf.d");
    if !conf_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files: Vec<_> = std::fs::read_dir(&conf_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("conf"))
        .collect();
    files.sort();

    let mut dirs = Vec::new();
    for file in files {
        let content = std::fs::read_to_string(&file)?;
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || !line.starts_with('/') {
                continue;
            }
            dirs.push(format!("{}{}", FUN_ROOT, line));
        }
    }
    tracing::debug!("ld.so.conf lib dirs: {:?}", dirs);
    Ok(dirs)
}

/// Credentials injected into invoke and start containers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalCredentials {
    pub access_key_id: String,
    pub access_key_secret: String,
}

impl LocalCredentials {
    /// Read from `FCLOCAL_ACCESS_KEY_ID` / `FCLOCAL_ACCESS_KEY_SECRET`, empty when unset
    pub fn from_env() -> Self {
        Self {
            access_key_id: std::env::var(ACCESS_KEY_ID_VAR).unwrap_or_default(),
            access_key_secret: std::env::var(ACCESS_KEY_SECRET_VAR).unwrap_or_default(),
        }
    }
}

/// Inputs for the invoke/start environment
#[derive(Debug, Clone, Default)]
pub struct FunctionEnvOptions<'a> {
    /// Host code directory scanned for ld.so.conf fragments
    pub code_dir: Option<&'a Path>,
    pub nas: Option<&'a NasConfig>,
    pub http_params: Option<&'a str>,
    pub http_trigger: bool,
    /// Debugger variables for the runtime
    pub debug_env: EnvVars,
    pub credentials: LocalCredentials,
}

/// Full environment of an invoke or start container
pub fn function_env(props: &FunctionProps, opts: FunctionEnvOptions<'_>) -> Result<EnvVars> {
    let mut env = EnvVars::new();

    if let Some(params) = opts.http_params {
        env.set("FC_HTTP_PARAMS", params);
    }

    env.merge(opts.debug_env);

    if opts.http_trigger && props.runtime == "java8" {
        env.set("fc_enable_new_java_ca", "true");
    }

    for (key, value) in &props.environment_variables {
        env.set(key.as_str(), value.as_str());
    }

    if let Some(code_dir) = opts.code_dir {
        let dirs = ld_conf_lib_dirs(code_dir)?;
        if !dirs.is_empty() {
            env.prepend_path("LD_LIBRARY_PATH", &dirs.join(":"));
        }
    }

    env.set("local", "true");
    env.set("FC_ACCESS_KEY_ID", opts.credentials.access_key_id);
    env.set("FC_ACCESS_KEY_SECRET", opts.credentials.access_key_secret);

    Ok(with_runtime_paths(env, &nas_mount_dirs(opts.nas)))
}
