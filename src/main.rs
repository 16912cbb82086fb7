#![deny(rust_2018_idioms, broken_intra_doc_links)]

mod macros;

use cafe_link::{
    fsa::DEFAULT_MODE_MASK, Config, Connection, FsaClient, InstallTarget, RemoteAddress,
    TcpTransport, DEFAULT_PORT,
};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

/// Bytes moved per file read or write by `pull` and `push`.
const TRANSFER_CHUNK: u32 = 0x4000;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Console(#[from] cafe_link::Error),
    #[error("due to a local I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("to install the logger.")]
    Logger(#[from] log::SetLoggerError),
}

/// Client for the IOSU debug stub of a Wii U.
#[derive(argh::FromArgs)]
struct Arguments {
    /// address of the console.
    #[argh(option, short = 'a')]
    address: String,
    /// port the stub listens on.
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,
    /// connection attempts before giving up.
    #[argh(option, default = "3")]
    attempts: u32,
    /// give up on a response after this many milliseconds.
    #[argh(option)]
    timeout_ms: Option<u64>,
    /// print every frame and driver call.
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(argh::FromArgs)]
#[argh(subcommand)]
enum Command {
    Ls(Ls),
    Stat(Stat),
    MakeDir(MakeDir),
    Remove(Remove),
    Move(Move),
    CopyFile(CopyFile),
    ChangeMode(ChangeMode),
    Pull(Pull),
    Push(Push),
    Peek(Peek),
    Mount(Mount),
    Unmount(Unmount),
    Flush(Flush),
    Install(Install),
    Progress(Progress),
    DeleteTitle(DeleteTitle),
    CopyTitle(CopyTitle),
    Shutdown(Shutdown),
    Reset(Reset),
}

/// list a directory.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "ls")]
struct Ls {
    #[argh(positional)]
    path: String,
}

/// show the metadata of a file.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "stat")]
struct Stat {
    #[argh(positional)]
    path: String,
}

/// create a directory.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "mkdir")]
struct MakeDir {
    #[argh(positional)]
    path: String,
    /// directory flags, in hex.
    #[argh(option, default = "0x600", from_str_fn(parse_hex))]
    flags: u32,
}

/// remove a file or an empty directory.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "rm")]
struct Remove {
    #[argh(positional)]
    path: String,
}

/// rename a file or directory.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "mv")]
struct Move {
    #[argh(positional)]
    from: String,
    #[argh(positional)]
    to: String,
}

/// copy a file on the console without downloading it.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "cp")]
struct CopyFile {
    #[argh(positional)]
    from: String,
    #[argh(positional)]
    to: String,
}

/// change the mode bits of a path.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "chmod")]
struct ChangeMode {
    #[argh(positional)]
    path: String,
    #[argh(positional, from_str_fn(parse_hex))]
    mode: u32,
    /// bits of the mode to change, in hex.
    #[argh(option, default = "DEFAULT_MODE_MASK", from_str_fn(parse_hex))]
    mask: u32,
}

/// copy a file from the console.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "pull")]
struct Pull {
    #[argh(positional)]
    remote: String,
    #[argh(positional)]
    local: PathBuf,
}

/// copy a file to the console.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "push")]
struct Push {
    #[argh(positional)]
    local: PathBuf,
    #[argh(positional)]
    remote: String,
}

/// dump console memory.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "peek")]
struct Peek {
    #[argh(positional, from_str_fn(parse_hex))]
    address: u32,
    #[argh(positional, from_str_fn(parse_hex))]
    len: u32,
}

/// mount a device. The volume stays mounted after the command exits.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "mount")]
struct Mount {
    #[argh(positional)]
    device: String,
    #[argh(positional)]
    volume: String,
    /// mount flags, in hex.
    #[argh(option, default = "2", from_str_fn(parse_hex))]
    flags: u32,
}

/// unmount a volume.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "unmount")]
struct Unmount {
    #[argh(positional)]
    volume: String,
    /// unmount flags, in hex.
    #[argh(option, default = "2", from_str_fn(parse_hex))]
    flags: u32,
}

/// flush a volume.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "flush")]
struct Flush {
    #[argh(positional)]
    volume: String,
}

/// start installing a title from a directory on the console.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "install")]
struct Install {
    #[argh(positional)]
    path: String,
    /// install to USB storage instead of internal storage.
    #[argh(switch)]
    usb: bool,
}

/// show the progress of the running install.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "progress")]
struct Progress {}

/// delete an installed title.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "delete-title")]
struct DeleteTitle {
    #[argh(positional)]
    path: String,
    /// flush the volume afterwards.
    #[argh(switch)]
    flush: bool,
}

/// copy an installed title to other storage.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "copy-title")]
struct CopyTitle {
    #[argh(positional)]
    path: String,
    /// copy to USB storage instead of internal storage.
    #[argh(switch)]
    usb: bool,
    /// flush the volume afterwards.
    #[argh(switch)]
    flush: bool,
}

/// power the console off.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "shutdown")]
struct Shutdown {}

/// reboot the console.
#[derive(argh::FromArgs)]
#[argh(subcommand, name = "reset")]
struct Reset {}

fn main() {
    let args = argh::from_env::<Arguments>();
    if let Err(err) = run(args) {
        error!("Failed", "{}", err);
        if let Error::Console(err) = &err {
            if let Some(status) = err.status() {
                error!("Status", "{} ({})", status, status.as_i32());
            }
        }
        std::process::exit(1);
    }
}

fn run(args: Arguments) -> Result<(), Error> {
    macros::init_logger(args.verbose)?;

    let config = Config {
        port: args.port,
        connect_attempts: args.attempts,
        read_timeout: args.timeout_ms.map(Duration::from_millis),
        ..Config::new(args.address)
    };

    info!("Connecting", "to {}:{}...", config.address, config.port);
    let connection = Connection::connect(&config)?;
    ok!("Connected", "to {}:{}", config.address, config.port);

    execute(connection, args.command)
}

fn execute(mut connection: Connection<TcpTransport>, command: Command) -> Result<(), Error> {
    match command {
        Command::Ls(Ls { path }) => list(&mut connection.fsa()?, &path)?,
        Command::Stat(Stat { path }) => {
            let mut fsa = connection.fsa()?;
            let file = fsa.open_file(&path, "r")?;
            let stat = fsa.stat_file(&file);
            fsa.close_file(file)?;
            let stat = stat?;
            info!("Size", "{} bytes", stat.size());
            info!("Mode", "{:#x}", stat.mode());
            info!("Owner", "{:#x}", stat.owner());
            info!("Group", "{:#x}", stat.group());
            info!("Flags", "{:#010x}", stat.flags());
        }
        Command::MakeDir(MakeDir { path, flags }) => {
            connection.fsa()?.make_dir(&path, flags)?;
            ok!("Created", "{}", path);
        }
        Command::Remove(Remove { path }) => {
            connection.fsa()?.remove(&path)?;
            ok!("Removed", "{}", path);
        }
        Command::Move(Move { from, to }) => {
            connection.fsa()?.rename(&from, &to)?;
            ok!("Moved", "{} to {}", from, to);
        }
        Command::CopyFile(CopyFile { from, to }) => {
            let copied = connection.fsa()?.copy_file(&from, &to)?;
            ok!("Copied", "{} bytes from {} to {}", copied, from, to);
        }
        Command::ChangeMode(ChangeMode { path, mode, mask }) => {
            connection.fsa()?.change_mode(&path, mode, mask)?;
            ok!("Changed", "mode of {} to {:#x}", path, mode);
        }
        Command::Pull(Pull { remote, local }) => {
            let data = pull(&mut connection.fsa()?, &remote)?;
            std::fs::write(&local, &data)?;
            ok!("Pulled", "{} bytes to {:?}", data.len(), local);
        }
        Command::Push(Push { local, remote }) => {
            let data = std::fs::read(&local)?;
            push(&mut connection.fsa()?, &remote, &data)?;
            ok!("Pushed", "{} bytes to {}", data.len(), remote);
        }
        Command::Peek(Peek { address, len }) => {
            let data = connection
                .channel()
                .read_bytes(RemoteAddress::from_raw(address), len as usize)?;
            for (index, line) in data.chunks(16).enumerate() {
                let hex = line
                    .iter()
                    .map(|byte| format!("{:02x}", byte))
                    .collect::<Vec<_>>()
                    .join(" ");
                info!(&format!("{:08x}", address as usize + index * 16), "{}", hex);
            }
        }
        Command::Mount(Mount {
            device,
            volume,
            flags,
        }) => {
            connection.fsa()?.mount(&device, &volume, flags)?;
            connection.keep_mounted(&volume);
            ok!("Mounted", "{} at {}", device, volume);
        }
        Command::Unmount(Unmount { volume, flags }) => {
            connection.fsa()?.unmount(&volume, flags)?;
            ok!("Unmounted", "{}", volume);
        }
        Command::Flush(Flush { volume }) => {
            connection.fsa()?.flush_volume(&volume)?;
            ok!("Flushed", "{}", volume);
        }
        Command::Install(Install { path, usb }) => {
            let mut mcp = connection.mcp()?;
            let info = mcp.begin_install(&path, target(usb))?;
            mcp.close()?;
            ok!("Started", "install of {} ({:08x?})", path, info.words);
        }
        Command::Progress(_) => {
            let mut mcp = connection.mcp()?;
            let progress = mcp.install_get_progress()?;
            mcp.close()?;
            if progress.in_progress {
                info!(
                    "Installing",
                    "{:016x}: {}/{} bytes, {}/{} contents",
                    progress.title_id,
                    progress.size_progress,
                    progress.size_total,
                    progress.contents_progress,
                    progress.contents_total
                );
            } else {
                info!("Idle", "no install running.");
            }
        }
        Command::DeleteTitle(DeleteTitle { path, flush }) => {
            let mut mcp = connection.mcp()?;
            mcp.delete_title(&path, flush)?;
            mcp.close()?;
            ok!("Deleted", "{}", path);
        }
        Command::CopyTitle(CopyTitle { path, usb, flush }) => {
            let mut mcp = connection.mcp()?;
            mcp.copy_title(&path, target(usb), flush)?;
            mcp.close()?;
            ok!("Copied", "{}", path);
        }
        Command::Shutdown(_) => {
            connection.shutdown()?;
            ok!("Sent", "shutdown request.");
            return Ok(());
        }
        Command::Reset(_) => {
            connection.reset()?;
            ok!("Sent", "reset request.");
            return Ok(());
        }
    }

    connection.close()?;
    Ok(())
}

fn list(fsa: &mut FsaClient<'_, TcpTransport>, path: &str) -> Result<(), cafe_link::Error> {
    let dir = fsa.open_dir(path)?;
    let result = loop {
        match fsa.read_dir(&dir) {
            Ok(entry) if entry.is_file => {
                info!("File", "{} ({} bytes)", entry.name, entry.stat().size());
            }
            Ok(entry) => {
                info!("Dir", "{}/", entry.name);
            }
            // The driver ends the listing with a status.
            Err(cafe_link::Error::Status(_)) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    fsa.close_dir(dir)?;
    result
}

fn pull(fsa: &mut FsaClient<'_, TcpTransport>, path: &str) -> Result<Vec<u8>, cafe_link::Error> {
    let file = fsa.open_file(path, "r")?;
    let mut data = Vec::new();
    let result = loop {
        match fsa.read_file(&file, 1, TRANSFER_CHUNK) {
            Ok(chunk) => {
                data.extend_from_slice(&chunk);
                if chunk.len() < TRANSFER_CHUNK as usize {
                    break Ok(());
                }
            }
            Err(err) => break Err(err),
        }
    };
    fsa.close_file(file)?;
    result.map(|()| data)
}

fn push(
    fsa: &mut FsaClient<'_, TcpTransport>,
    path: &str,
    data: &[u8],
) -> Result<(), cafe_link::Error> {
    let file = fsa.open_file(path, "w")?;
    let result = fsa.write_all(&file, data, TRANSFER_CHUNK as usize);
    fsa.close_file(file)?;
    result
}

fn target(usb: bool) -> InstallTarget {
    if usb {
        InstallTarget::Usb
    } else {
        InstallTarget::Internal
    }
}

fn parse_hex(value: &str) -> Result<u32, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).map_err(|err| format!("invalid hex value {:?}: {}", value, err))
}
