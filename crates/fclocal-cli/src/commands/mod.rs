//! CLI command implementations

mod function;
mod image;
mod runtime;

use crate::{Commands, DebugArgs};
use anyhow::{anyhow, bail, Context, Result};
use fclocal_config::FunctionDefinition;
use fclocal_core::spec::{DebugConfig, DebugIde, EnvVars, EventDelivery, InstallTarget, LocalCredentials};
use fclocal_core::{ContainerManager, InstallRequest, InvokeRequest, SboxRequest};
use std::io::Read;
use std::path::{Path, PathBuf};

/// A command with its local inputs loaded and validated
pub enum Prepared {
    Invoke(InvokeRequest),
    Start(InvokeRequest),
    Install {
        request: InstallRequest,
        cwd: String,
        env: EnvVars,
        cmd: Vec<String>,
    },
    Sbox(SboxRequest),
    Build {
        context: PathBuf,
        dockerfile: PathBuf,
        tag: String,
    },
    Pull {
        image: Option<String>,
        runtime: Option<String>,
        build: bool,
    },
    Copy {
        image: String,
        from: String,
        to: PathBuf,
    },
}

/// Load definitions, events and flags; nothing here talks to the engine
pub fn prepare(command: Commands) -> Result<Prepared> {
    let prepared = match command {
        Commands::Invoke {
            definition,
            event,
            event_file,
            inline_event,
            debug,
            tmp_dir,
            http_params,
            http,
            no_initializer,
        } => {
            let mut request = load_request(&definition, &debug)?;
            let payload = match (event, event_file) {
                (Some(event), _) => Some(event.into_bytes()),
                (None, Some(path)) => Some(read_event_file(&path)?),
                (None, None) => None,
            };
            request.event = payload.map(|p| {
                if inline_event {
                    EventDelivery::Inline(p)
                } else {
                    EventDelivery::Stdin(p)
                }
            });
            request.tmp_dir = tmp_dir;
            request.http_params = http_params;
            request.http = http;
            request.invoke_initializer = !no_initializer;
            Prepared::Invoke(request)
        }
        Commands::Start {
            definition,
            debug,
            tmp_dir,
        } => {
            let mut request = load_request(&definition, &debug)?;
            request.tmp_dir = tmp_dir;
            Prepared::Start(request)
        }
        Commands::Install {
            runtime,
            code_uri,
            targets,
            image,
            cwd,
            env,
            cmd,
        } => {
            let targets = targets
                .iter()
                .map(|t| InstallTarget::parse(t))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Prepared::Install {
                request: InstallRequest {
                    runtime,
                    image,
                    code_uri,
                    targets,
                },
                cwd,
                env: parse_env_pairs(&env)?,
                cmd,
            }
        }
        Commands::Sbox {
            runtime,
            code_uri,
            cmd,
            env,
            interactive,
            tty,
            image,
        } => Prepared::Sbox(SboxRequest {
            runtime,
            image,
            code_uri,
            cmd,
            env: parse_env_pairs(&env)?,
            tty,
            interactive,
        }),
        Commands::Build {
            context,
            dockerfile,
            tag,
        } => {
            let context = fclocal_core::spec::absolute_path(&context)?;
            let dockerfile = match dockerfile {
                Some(path) if path.is_absolute() => path,
                Some(path) => context.join(path),
                None => context.join("Dockerfile"),
            };
            Prepared::Build {
                context,
                dockerfile,
                tag,
            }
        }
        Commands::Pull {
            image,
            runtime,
            build,
        } => Prepared::Pull {
            image,
            runtime,
            build,
        },
        Commands::Copy { image, from, to } => Prepared::Copy { image, from, to },
    };
    Ok(prepared)
}

/// Run a prepared command, returning the process exit code
pub async fn execute(manager: &ContainerManager, command: Prepared, verbose: bool) -> Result<i32> {
    match command {
        Prepared::Invoke(request) => function::invoke(manager, request).await,
        Prepared::Start(request) => function::start(manager, request).await,
        Prepared::Install {
            request,
            cwd,
            env,
            cmd,
        } => runtime::install(manager, request, cwd, env, cmd, verbose).await,
        Prepared::Sbox(request) => runtime::sbox(manager, request).await,
        Prepared::Build {
            context,
            dockerfile,
            tag,
        } => image::build(manager, &context, &dockerfile, &tag).await,
        Prepared::Pull {
            image,
            runtime,
            build,
        } => image::pull(manager, image, runtime, build).await,
        Prepared::Copy { image, from, to } => image::copy(manager, &image, &from, &to).await,
    }
}

fn load_request(definition: &Path, debug: &DebugArgs) -> Result<InvokeRequest> {
    let definition_path = fclocal_core::spec::absolute_path(definition)?;
    let loaded = FunctionDefinition::load_from(&definition_path)?;
    let base_dir = definition_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("{} has no parent directory", definition_path.display()))?;

    let mut request = InvokeRequest::new(loaded, base_dir);
    request.credentials = LocalCredentials::from_env();
    request.debug = parse_debug(debug)?;
    Ok(request)
}

fn parse_debug(args: &DebugArgs) -> Result<Option<DebugConfig>> {
    let ide: DebugIde = args.debug_ide.parse()?;
    Ok(args.debug_port.map(|port| DebugConfig { port, ide }))
}

fn read_event_file(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read event from stdin")?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("Failed to read event file {}", path.display()))
}

/// Process exit code for a container status; out-of-range statuses become 1
fn exit_code(status_code: i64) -> i32 {
    i32::try_from(status_code).unwrap_or(1)
}

/// Parse `KEY=VALUE` pairs
pub fn parse_env_pairs(pairs: &[String]) -> Result<EnvVars> {
    let mut env = EnvVars::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => env.set(key, value),
            _ => bail!("Invalid environment variable '{}', expected KEY=VALUE", pair),
        }
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pairs() {
        let env = parse_env_pairs(&["A=1".into(), "B=x=y".into(), "C=".into()]).unwrap();
        assert_eq!(env.get("A"), Some("1"));
        assert_eq!(env.get("B"), Some("x=y"));
        assert_eq!(env.get("C"), Some(""));

        assert!(parse_env_pairs(&["NOVALUE".into()]).is_err());
        assert!(parse_env_pairs(&["=1".into()]).is_err());
    }

    #[test]
    fn test_exit_code_range() {
        assert_eq!(exit_code(0), 0);
        assert_eq!(exit_code(137), 137);
        assert_eq!(exit_code(-1), -1);
        assert_eq!(exit_code(i64::from(i32::MAX) + 1), 1);
        assert_eq!(exit_code(i64::MIN), 1);
    }

    #[test]
    fn test_parse_debug() {
        let none = parse_debug(&DebugArgs {
            debug_port: None,
            debug_ide: "vscode".into(),
        })
        .unwrap();
        assert!(none.is_none());

        let pycharm = parse_debug(&DebugArgs {
            debug_port: Some(5678),
            debug_ide: "PyCharm".into(),
        })
        .unwrap()
        .unwrap();
        assert_eq!(pycharm.ide, DebugIde::PyCharm);
        assert_eq!(pycharm.port, 5678);

        assert!(parse_debug(&DebugArgs {
            debug_port: Some(1),
            debug_ide: "vim".into(),
        })
        .is_err());
    }

    #[test]
    fn test_prepare_invoke_loads_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fn.toml");
        std::fs::write(
            &path,
            "[service]\nname = \"demo\"\n\n[function]\nname = \"hello\"\nruntime = \"nodejs8\"\nhandler = \"index.handler\"\n",
        )
        .unwrap();

        let prepared = prepare(Commands::Invoke {
            definition: path,
            event: Some("{}".into()),
            event_file: None,
            inline_event: true,
            debug: DebugArgs {
                debug_port: None,
                debug_ide: "vscode".into(),
            },
            tmp_dir: None,
            http_params: None,
            http: false,
            no_initializer: true,
        })
        .unwrap();

        match prepared {
            Prepared::Invoke(request) => {
                assert_eq!(request.base_dir, dir.path());
                assert_eq!(request.event, Some(EventDelivery::Inline(b"{}".to_vec())));
                assert!(!request.invoke_initializer);
                assert_eq!(request.definition.function.handler, "index.handler");
            }
            _ => panic!("expected invoke"),
        }
    }

    #[test]
    fn test_prepare_install_rejects_bad_target() {
        let err = prepare(Commands::Install {
            runtime: "python3".into(),
            code_uri: ".".into(),
            targets: vec!["relative/only".into()],
            image: None,
            cwd: "/code".into(),
            env: vec![],
            cmd: vec!["pip".into()],
        });
        assert!(err.is_err());
    }
}
