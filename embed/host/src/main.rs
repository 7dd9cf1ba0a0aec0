use anyhow::{bail, Context, Result};
use bridge::{load_config, BridgeContext, BridgeError, CallDescriptor};
use log::{debug, error, info};
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit code for failures that did not come from the runtime.
const EXIT_HOST_FAILURE: u8 = 125;

const USAGE: &str = "usage: embed_host [--config <path>] <library> <Type.Member>";

#[derive(Debug, PartialEq)]
struct Args {
    config: PathBuf,
    library: String,
    declaring_type: String,
    member: String,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut config = PathBuf::from("bridge.json");
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = args.next().context("--config needs a path")?.into(),
            _ => positional.push(arg),
        }
    }

    let [library, target] = <[String; 2]>::try_from(positional).map_err(|_| anyhow::anyhow!(USAGE))?;
    let Some((declaring_type, member)) = target.rsplit_once('.') else {
        bail!("expected <Type.Member>, got {:?}", target);
    };
    if declaring_type.is_empty() || member.is_empty() {
        bail!("expected <Type.Member>, got {:?}", target);
    }

    Ok(Args {
        config,
        library,
        declaring_type: declaring_type.to_string(),
        member: member.to_string(),
    })
}

fn run(args: &Args) -> Result<i32> {
    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    debug!("Loaded Config: {:?}", config);

    let context = BridgeContext::from_config(config).context("Failed to set up the bridge")?;
    let call = CallDescriptor::new(&args.declaring_type, &args.member).returns::<i32>();
    info!("Invoking {} in {}", call.method(), args.library);

    let value = context.call::<i32>(&args.library, &call, &mut [])?;
    Ok(value)
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<BridgeError>()
        .and_then(BridgeError::code)
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(EXIT_HOST_FAILURE)
}

fn main() -> ExitCode {
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "info");
        }
    }
    env_logger::init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_HOST_FAILURE);
        }
    };

    match run(&args) {
        Ok(value) => {
            println!("{}", value);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}
