#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use anyhow::{bail, Context, Result};
use argh::FromArgs;

use std::io::{BufRead, Write};
use std::time::Duration;

use tokio::sync::mpsc;

use ssh_probe::*;

use simplelog::*;
use time::UtcOffset;
use zeroize::Zeroizing;

#[derive(argh::FromArgs, Debug)]
/** Probe an SSH server: run a shell, a command or a subsystem
 */
struct Args {
    #[argh(switch, short = 'v')]
    /// verbose debug logging
    debug: bool,

    #[argh(switch)]
    /// more verbose
    trace: bool,

    #[argh(option, short = 'i')]
    /// a path to an OpenSSH id_ed25519 private key
    identityfile: Option<String>,

    #[argh(option)]
    /// a JSON connection request file, replacing the host and auth arguments
    request: Option<String>,

    #[argh(option, short = 'l')]
    /// username
    username: Option<String>,

    #[argh(positional)]
    /// host, or user@host
    host: Option<String>,

    #[argh(option, short = 'p', default = "22")]
    /// port
    port: u16,

    #[argh(option, short = 's')]
    /// ssh subsystem (eg "sftp")
    subsystem: Option<String>,

    #[argh(option, default = "30")]
    /// timeout in seconds for each handshake step
    timeout: u64,

    #[argh(switch)]
    /// check the host key signature over the exchange hash
    verify_hostkey: bool,

    #[argh(switch)]
    /// send stdin to a command or subsystem before reading its output
    stdin: bool,

    #[argh(positional, greedy)]
    /// command
    cmd: Vec<String>,
}

fn main() {
    // Crates won't let us read from environment variables once
    // threading starts, so do it before tokio main.
    let tz = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    if let Err(e) = real_main(tz) {
        error!("Exit with error: {e:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn real_main(tz: UtcOffset) -> Result<()> {
    let args: Args = argh::from_env();
    setup_log(&args, tz)?;
    trace!("args {args:?}");

    if !args.cmd.is_empty() && args.subsystem.is_some() {
        bail!("can't have '-s subsystem' with a command")
    }

    let mut params = match args.request.as_ref() {
        Some(r) => {
            let s = std::fs::read_to_string(r).with_context(|| format!("reading {r}"))?;
            ConnectRequest::from_json(&s)?.into_params()?
        }
        None => params_from_args(&args)?,
    };
    params.timeout = Duration::from_secs(args.timeout);
    params.verify_hostkey_signature = args.verify_hostkey;

    if let Some(sub) = args.subsystem.as_ref() {
        run_channel(&params, sub, false, args.stdin).await
    } else if !args.cmd.is_empty() {
        run_channel(&params, &args.cmd.join(" "), true, args.stdin).await
    } else {
        run_interactive(&params).await
    }
}

fn params_from_args(args: &Args) -> Result<ConnectParams> {
    let Some(mut host) = args.host.clone() else {
        bail!("a host or --request is required")
    };
    let mut username = args.username.clone();
    if username.is_none() {
        // user@host syntax. rsplit for usernames with @ in them
        if let Some((u, h)) = host.rsplit_once('@') {
            username = Some(u.into());
            host = h.into();
        }
    }
    let username = username.unwrap_or_else(whoami::username);

    let auth = match args.identityfile.as_ref() {
        Some(i) => AuthCredential::PublicKey(read_key(i).with_context(|| format!("loading key {i}"))?),
        None => {
            let pw = rpassword::prompt_password(format!("{username}@{host}'s password: "))?;
            AuthCredential::Password(Zeroizing::new(pw))
        }
    };
    let mut p = ConnectParams::new(&host, &username, auth);
    p.port = args.port;
    Ok(p)
}

fn read_key(p: &str) -> Result<SignKey> {
    let text = Zeroizing::new(std::fs::read_to_string(p)?);
    match parse_openssh(&text, None) {
        Err(Error::KeyEncrypted) => {
            let pw = Zeroizing::new(rpassword::prompt_password(format!("Passphrase for {p}: "))?);
            Ok(parse_openssh(&text, Some(pw.as_str()))?)
        }
        r => Ok(r?),
    }
}

async fn run_channel(params: &ConnectParams, name: &str, is_exec: bool, send_stdin: bool) -> Result<()> {
    let mut sub = connect_subsystem(params, name, is_exec).await?;
    info!("Started {name}");

    if send_stdin {
        let input = tokio::task::spawn_blocking(|| {
            let mut v = vec![];
            std::io::Read::read_to_end(&mut std::io::stdin(), &mut v).map(|_| v)
        })
        .await??;
        sub.send_channel_data(&input).await?;
    }

    let mut out = std::io::stdout();
    while let Some(d) = sub.read_channel_data().await? {
        out.write_all(&d)?;
        out.flush()?;
    }
    if let Some(st) = sub.exit_status() {
        info!("Exit status {st}");
    }
    sub.close().await?;
    Ok(())
}

async fn run_interactive(params: &ConnectParams) -> Result<()> {
    let (in_tx, in_rx) = mpsc::channel(16);
    let (ev_tx, mut ev_rx) = mpsc::channel(64);

    // stdin is line buffered, no raw terminal mode
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(mut line) = line else { break };
            line.push('\n');
            if in_tx.blocking_send(ShellInput::Text(line)).is_err() {
                break;
            }
        }
    });

    let printer = async {
        let mut out = std::io::stdout();
        while let Some(ev) = ev_rx.recv().await {
            match ev {
                ShellEvent::Output(d) => {
                    out.write_all(&d)?;
                    out.flush()?;
                }
                ShellEvent::Control(c) => eprintln!("{}", c.to_json()?),
            }
        }
        Ok::<_, anyhow::Error>(())
    };

    let (res, out) = tokio::join!(connect_shell(params, in_rx, ev_tx), printer);
    out?;
    res?;
    Ok(())
}

fn setup_log(args: &Args, tz: UtcOffset) -> Result<()> {
    let mut conf = simplelog::ConfigBuilder::new();
    let conf = conf
        .add_filter_allow_str("ssh_probe")
        .add_filter_allow_str("probe_ssh")
        .set_time_offset(tz)
        .build();

    let level = if args.trace {
        LevelFilter::Trace
    } else if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };

    TermLogger::init(level, conf, TerminalMode::Stderr, ColorChoice::Auto)?;
    Ok(())
}
