//! Store server daemon: one synchronous session per TCP connection, plus a
//! housekeeping thread that reclaims space between them.
//!
//! Usage: `strataguard-backup-server <config.json> <keystore-file> <bind-addr>`.
//! Process supervision, TLS termination, and a real provisioning tool are
//! out of scope -- this is the session loop the spec describes, nothing
//! that would normally sit in front of it.

use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Error};
use log::{error, info, warn};

use strataguard_backup::cipher::{CipherTag, Keystore};
use strataguard_backup::config::StoreConfig;
use strataguard_backup::error::StoreError;
use strataguard_backup::housekeeping;
use strataguard_backup::protocol::{Command, Reply, Session};
use strataguard_backup::raid::{DiscSet, RaidFileWriter};
use strataguard_backup::store::context::{object_path, Context};
use strataguard_backup::store::directory::StoreDirectory;
use strataguard_backup::store::ledger::AccountLedger;
use strataguard_backup::store::lock::{acquire_for_writer_session, HousekeepingIpc};
use strataguard_backup::wire::{read_frame, write_frame};

const WRITE_LOCK_ATTEMPTS: u32 = 5;
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(300);

fn round_up_to_blocks(bytes: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        0
    } else {
        (bytes + block_size - 1) / block_size
    }
}

/// Provision an account's root directory and ledger the first time it is
/// seen. A real deployment would do this out-of-band; here it keeps the
/// server usable against a freshly written config with no data on disc yet.
fn ensure_account_initialized(disc_set: &DiscSet, account_id: u32, soft_limit_bytes: u64, hard_limit_bytes: u64) -> Result<(), Error> {
    if AccountLedger::load(disc_set, account_id).is_ok() {
        return Ok(());
    }
    let root = StoreDirectory::new(0);
    let mut buf = Vec::new();
    root.write_to(&mut buf)?;
    let mut w = RaidFileWriter::create(disc_set, &object_path(0))?;
    w.write_all(&buf)?;
    w.commit(disc_set.is_raided())?;

    let block_size = disc_set.block_size().max(1);
    let mut ledger = AccountLedger::new(
        account_id,
        format!("account-{}", account_id),
        round_up_to_blocks(soft_limit_bytes, block_size),
        round_up_to_blocks(hard_limit_bytes, block_size),
    );
    ledger.force_save(disc_set)
}

fn build_context(
    config: &StoreConfig,
    keystore: Arc<Keystore>,
    ipc: &HousekeepingIpc,
    account_id: u32,
    read_only: bool,
) -> Result<Context, Error> {
    let account = config
        .account(account_id)
        .with_context(|| format!("unknown account {}", account_id))?;
    let disc_set = account.disc_set.to_disc_set();
    ensure_account_initialized(&disc_set, account_id, account.soft_limit_bytes, account.hard_limit_bytes)?;

    let ledger = AccountLedger::load(&disc_set, account_id)?;
    let mut context = Context::new(account_id, read_only, disc_set.clone(), (*keystore).clone(), ledger);

    if !read_only {
        let account_root = disc_set.discs()[0].clone();
        // Held on the Context, not dropped here: releasing the flock has to
        // wait for the whole session to end, not just this login command.
        context.write_lock = Some(acquire_for_writer_session(&account_root, account_id, ipc, WRITE_LOCK_ATTEMPTS)?);
    }

    Ok(context)
}

fn handle_connection(stream: TcpStream, config: Arc<StoreConfig>, keystore: Arc<Keystore>, ipc: Arc<HousekeepingIpc>) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".into());
    info!("session started: {}", peer);

    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!("session {}: failed to clone socket: {}", peer, e);
            return;
        }
    };
    let mut reader = BufReader::new(reader_stream);
    let mut writer = BufWriter::new(stream);

    let mut session = Session::new();
    loop {
        let command: Command = match read_frame(&mut reader) {
            Ok(c) => c,
            Err(e) => {
                warn!("session {}: ending ({})", peer, e);
                return;
            }
        };
        let finished = matches!(command, Command::Finished);
        let reply = session.handle(command, |account_id, read_only| {
            build_context(&config, keystore.clone(), &ipc, account_id, read_only)
        });
        let stop = finished || matches!(reply, Reply::Error(StoreError::NotInRightProtocolPhase) if session.phase() == strataguard_backup::protocol::Phase::Version);
        if let Err(e) = write_frame(&mut writer, &reply) {
            warn!("session {}: write failed: {}", peer, e);
            return;
        }
        if finished || stop {
            info!("session {}: finished", peer);
            return;
        }
    }
}

fn housekeeping_loop(config: Arc<StoreConfig>, keystore: Arc<Keystore>, ipc: Arc<HousekeepingIpc>) {
    loop {
        std::thread::sleep(HOUSEKEEPING_INTERVAL);
        if matches!(ipc.poll(), Some(strataguard_backup::store::lock::HousekeepingSignal::Terminate)) {
            info!("housekeeping: terminating");
            return;
        }
        housekeeping::run_pass(&config, &keystore, &ipc);
    }
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 4 {
        anyhow::bail!("usage: {} <config.json> <keystore-file> <bind-addr>", args[0]);
    }
    let config_path = PathBuf::from(&args[1]);
    let keystore_path = PathBuf::from(&args[2]);
    let bind_addr = &args[3];

    let config = Arc::new(StoreConfig::load(&config_path)?);
    let keystore = Arc::new(Keystore::load(&keystore_path, CipherTag::preferred())?);
    let ipc = Arc::new(HousekeepingIpc::new());

    {
        let config = config.clone();
        let keystore = keystore.clone();
        let ipc = ipc.clone();
        std::thread::spawn(move || housekeeping_loop(config, keystore, ipc));
    }

    let listener = TcpListener::bind(bind_addr).with_context(|| format!("binding {}", bind_addr))?;
    info!("listening on {}", bind_addr);
    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(s) => s,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        let config = config.clone();
        let keystore = keystore.clone();
        let ipc = ipc.clone();
        std::thread::spawn(move || handle_connection(stream, config, keystore, ipc));
    }
    Ok(())
}
