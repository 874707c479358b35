mod cli;
mod settings;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use bitaxe_config::{Catalog, CatalogBase, Selection};
use bitaxe_downloader::Downloader;
use bitaxe_flasher::{
    CONNECTED, CONNECTING, EspFlasher, FirmwareSource, FlashingStatus, LocalFirmware,
    RemoteFirmware, Session, SystemPorts, connection_failed, flashing_failed, serial::PortKind,
    transcript::default_file_name,
};
use clap::{CommandFactory, Parser};
use cli::{CatalogCommands, Commands, ConfigCommands, Opt, SelectedFirmware, Sources};
use futures::{StreamExt, channel::mpsc};
use settings::Settings;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type CliSession = Session<SystemPorts, EspFlasher>;

/// How often a running log is checked for a lost port.
const LOG_CHECK_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    let opt = Opt::parse();

    let settings_path = Settings::path();
    let settings = match &settings_path {
        Some(p) => Settings::load_from(p)?,
        None => Settings::default(),
    };
    let sources = settings.merge(opt.sources);

    match opt.command {
        Commands::ListPorts { no_frills } => list_ports(no_frills),
        Commands::Catalog { query } => catalog(query, &sources).await,
        Commands::Flash {
            port,
            img,
            address,
            quiet,
            monitor,
            save,
        } => {
            let save = transcript_file(save, &settings);
            let picked = firmware_source(img, &sources).await?;
            let address = address.unwrap_or(picked.address);

            let mut session = connect(&port, quiet).await?;
            let res = match ready_to_flash(&session, &picked) {
                Ok(()) => flash(&mut session, &picked.src, address, quiet).await,
                Err(e) => Err(e),
            };
            let res = match res {
                Ok(()) if monitor => stream_log(&mut session).await,
                x => x,
            };

            let disconnected = session.disconnect().await;
            save_transcript(&session, save, quiet)?;
            res?;
            Ok(disconnected?)
        }
        Commands::Monitor { port, save } => {
            let save = transcript_file(save, &settings);
            let mut session = connect(&port, false).await?;
            let res = stream_log(&mut session).await;

            let disconnected = session.disconnect().await;
            save_transcript(&session, save, false)?;
            res?;
            Ok(disconnected?)
        }
        Commands::Config { action } => config(action, settings, settings_path),
        Commands::GenerateCompletion { shell } => {
            generate_completion(shell);
            Ok(())
        }
    }
}

fn list_ports(no_frills: bool) -> anyhow::Result<()> {
    const NAME_HEADER: &str = "Port";
    const ID_HEADER: &str = "VID:PID";
    const PRODUCT_HEADER: &str = "Product";

    let term = console::Term::stdout();
    let ports = bitaxe_flasher::serial::ports()?;

    if no_frills {
        for p in ports {
            term.write_line(&p.name)?;
        }
        return Ok(());
    }

    // Name, USB ids, product
    type Row = (String, String, String);
    let rows: Vec<Row> = ports
        .into_iter()
        .map(|p| match &p.kind {
            PortKind::Usb(x) => (
                p.name.clone(),
                format!("{:04x}:{:04x}", x.vid, x.pid),
                x.product.clone().unwrap_or_default(),
            ),
            PortKind::Pci => (p.name.clone(), "pci".to_string(), String::new()),
            PortKind::Bluetooth => (p.name.clone(), "bluetooth".to_string(), String::new()),
            PortKind::Unknown => (p.name.clone(), "-".to_string(), String::new()),
        })
        .collect();

    let width = |header: &str, f: fn(&Row) -> usize| {
        rows.iter().map(f).chain([header.len()]).max().unwrap_or(0)
    };
    let name_len = width(NAME_HEADER, |x: &Row| x.0.len());
    let id_len = width(ID_HEADER, |x: &Row| x.1.len());
    let product_len = width(PRODUCT_HEADER, |x: &Row| x.2.len());

    let table_border = format!(
        "+-{}-+-{}-+-{}-+",
        "-".repeat(name_len),
        "-".repeat(id_len),
        "-".repeat(product_len),
    );
    let row = |a: &str, b: &str, c: &str| {
        format!(
            "| {} | {} | {} |",
            console::pad_str(a, name_len, console::Alignment::Left, None),
            console::pad_str(b, id_len, console::Alignment::Left, None),
            console::pad_str(c, product_len, console::Alignment::Left, None),
        )
    };

    term.write_line(&table_border)?;
    term.write_line(&row(NAME_HEADER, ID_HEADER, PRODUCT_HEADER))?;
    term.write_line(&table_border)?;
    for (name, id, product) in &rows {
        term.write_line(&row(name, id, product))?;
    }
    term.write_line(&table_border)?;

    Ok(())
}

async fn catalog(query: CatalogCommands, sources: &Sources) -> anyhow::Result<()> {
    let term = console::Term::stdout();
    let (catalog, _) = load_catalog(sources).await?;
    let mut selection = Selection::default();

    match query {
        CatalogCommands::Devices => {
            for d in catalog.devices() {
                let boards = d.boards.len();
                term.write_line(&format!(
                    "{:<10} {:<10} {boards} board{}",
                    d.model,
                    d.name,
                    if boards == 1 { "" } else { "s" }
                ))?;
            }
        }
        CatalogCommands::Boards { device } => {
            selection.select_device(&catalog, &device)?;
            for b in selection.available_boards(&catalog) {
                term.write_line(&b.version)?;
            }
        }
        CatalogCommands::Firmwares { device, board } => {
            selection.select_device(&catalog, &device)?;
            selection.select_board(&catalog, &board)?;

            let firmwares = selection.available_firmwares(&catalog);
            for (i, f) in firmwares.iter().enumerate() {
                let latest = if i + 1 == firmwares.len() {
                    " (latest)"
                } else {
                    ""
                };
                term.write_line(&format!("{}{latest}  {}", f.version, f.path))?;
            }
        }
    }

    Ok(())
}

fn downloader(sources: &Sources) -> anyhow::Result<Downloader> {
    let dir = match &sources.cache_dir {
        Some(x) => x.clone(),
        None => settings::project_dirs()
            .context("No home directory to keep a download cache in, use --cache-dir")?
            .cache_dir()
            .to_path_buf(),
    };

    Downloader::new(dir).context("Failed to create download cache")
}

/// The catalog in use and the base its relative paths resolve against. Without an explicit
/// firmware base, paths are relative to the catalog itself (or the working directory for the
/// built-in catalog).
async fn load_catalog(sources: &Sources) -> anyhow::Result<(Catalog, CatalogBase)> {
    let (catalog, base) = match sources.catalog.as_deref().map(CatalogBase::parse) {
        None => (Catalog::builtin(), CatalogBase::Dir(PathBuf::from("."))),
        Some(CatalogBase::Url(url)) => {
            let catalog: Catalog = downloader(sources)?
                .download_json_no_cache(url.clone())
                .await
                .with_context(|| format!("Failed to fetch catalog from {url}"))?;
            catalog.validate()?;

            let base = url.join("./").unwrap_or(url);
            (catalog, CatalogBase::Url(base))
        }
        Some(CatalogBase::Dir(path)) => {
            let catalog = Catalog::from_path(&path)
                .with_context(|| format!("Failed to load catalog {}", path.display()))?;
            let dir = path
                .parent()
                .map(|x| x.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            (catalog, CatalogBase::Dir(dir))
        }
    };

    let base = sources
        .firmware_base
        .as_deref()
        .map(CatalogBase::parse)
        .unwrap_or(base);

    Ok((catalog, base))
}

/// Firmware picked on the command line.
struct Picked {
    src: FirmwareSource,
    /// Offset the catalog puts the image at, 0 for custom images
    address: u32,
    selection: Option<(Catalog, Selection)>,
}

impl Picked {
    fn custom(src: FirmwareSource) -> Self {
        Self {
            src,
            address: 0,
            selection: None,
        }
    }
}

async fn firmware_source(img: SelectedFirmware, sources: &Sources) -> anyhow::Result<Picked> {
    if let Some(p) = img.img.local {
        let src = FirmwareSource::Local(LocalFirmware::new(p.into()));
        return Ok(Picked::custom(src));
    }

    if let Some(url) = img.img.remote {
        let sha256 = img
            .sha256
            .as_deref()
            .map(const_hex::decode_to_array::<_, 32>)
            .transpose()
            .context("Invalid SHA256 checksum")?;
        let src = RemoteFirmware::new(downloader(sources)?, url, sha256);
        return Ok(Picked::custom(FirmwareSource::Remote(src)));
    }

    let device = img
        .img
        .device
        .ok_or_else(|| anyhow!(bitaxe_config::Error::NoDevice))?;
    let board = img
        .board
        .ok_or_else(|| anyhow!(bitaxe_config::Error::NoBoard))?;

    let (catalog, base) = load_catalog(sources).await?;
    let mut selection = Selection::default();
    selection.select_device(&catalog, &device)?;
    selection.select_board(&catalog, &board)?;
    if let Some(v) = img.firmware {
        selection.select_firmware(&catalog, &v)?;
    }

    let (d, b, f) = selection
        .resolved(&catalog)
        .with_context(|| format!("No firmware available for {device} board {board}"))?;
    let location = f.locate(&base)?;
    tracing::info!(
        "Selected {} board {} firmware {} ({location})",
        d.name,
        b.version,
        f.version
    );

    let src = FirmwareSource::new(location, &downloader(sources)?, f.sha256);
    let address = f.address;
    Ok(Picked {
        src,
        address,
        selection: Some((catalog, selection)),
    })
}

/// Catalog images need a connected device and a complete selection.
fn ready_to_flash(session: &CliSession, picked: &Picked) -> anyhow::Result<()> {
    match &picked.selection {
        Some((catalog, selection)) if !session.can_flash(catalog, selection) => Err(anyhow!(
            "Connect a device and select a device model, board version and firmware first"
        )),
        _ => Ok(()),
    }
}

async fn connect(port: &str, quiet: bool) -> anyhow::Result<CliSession> {
    let term = console::Term::stdout();
    let mut session = Session::new(Arc::new(SystemPorts), Arc::new(EspFlasher::default()));

    if !quiet {
        term.write_line(CONNECTING)?;
    }

    let info = session
        .connect(bitaxe_flasher::serial::find_port(port))
        .await
        .map_err(|e| anyhow!(connection_failed(&e)))?;

    if !quiet {
        term.write_line(&format!("{CONNECTED} Detected {info} on {port}"))?;
    }

    Ok(session)
}

async fn flash(
    session: &mut CliSession,
    src: &FirmwareSource,
    address: u32,
    quiet: bool,
) -> anyhow::Result<()> {
    let res = if quiet {
        session.flash(src, address, None).await
    } else {
        let (tx, rx) = mpsc::channel(20);
        let progress = tokio::task::spawn(show_progress(rx));
        let res = session.flash(src, address, Some(tx)).await;

        if let Ok(Err(e)) = progress.await {
            tracing::warn!("Failed to draw progress: {e}");
        }
        res
    };

    res.map_err(|e| anyhow!(flashing_failed(&e)))
}

async fn show_progress(mut rx: mpsc::Receiver<FlashingStatus>) -> std::io::Result<()> {
    let term = console::Term::stdout();
    let bar_style = indicatif::ProgressStyle::with_template("{msg:15}  [{wide_bar}] [{percent:3} %]")
        .expect("Failed to create progress bar");
    let bars = indicatif::MultiProgress::new();

    let mut last_bar: Option<indicatif::ProgressBar> = None;
    let mut last_state: Option<FlashingStatus> = None;
    let mut stage = 0;

    while let Some(progress) = rx.next().await {
        // Skip if no change in stage
        if Some(progress) == last_state {
            continue;
        }

        match (progress, last_state) {
            // Take care when just progress needs to be updated
            (
                FlashingStatus::DownloadingProgress(p),
                Some(FlashingStatus::DownloadingProgress(_)),
            )
            | (FlashingStatus::FlashingProgress(p), Some(FlashingStatus::FlashingProgress(_))) => {
                if let Some(b) = &last_bar {
                    b.set_position((p * 100.0) as u64);
                }
            }
            // Create new bar when stage has changed
            (FlashingStatus::DownloadingProgress(p), _)
            | (FlashingStatus::FlashingProgress(p), _) => {
                if let Some(b) = last_bar.take() {
                    b.finish();
                }

                stage += 1;

                let temp_bar = bars.add(indicatif::ProgressBar::new(100));
                temp_bar.set_style(bar_style.clone());
                temp_bar.set_message(stage_msg(progress, stage));
                temp_bar.set_position((p * 100.0) as u64);
                last_bar = Some(temp_bar);
            }
            // Print stage when entering a new stage without progress
            (FlashingStatus::Preparing, _)
            | (FlashingStatus::Resetting, _)
            | (FlashingStatus::Finished, _) => {
                if let Some(b) = last_bar.take() {
                    b.finish();
                }

                stage += 1;
                term.write_line(&stage_msg(progress, stage))?;
            }
        }

        last_state = Some(progress);
    }

    if let Some(b) = last_bar.take() {
        b.finish();
    }

    Ok(())
}

const fn progress_msg(status: FlashingStatus) -> &'static str {
    match status {
        FlashingStatus::Preparing => "Preparing",
        FlashingStatus::DownloadingProgress(_) => "Downloading",
        FlashingStatus::FlashingProgress(_) => "Flashing",
        FlashingStatus::Resetting => "Resetting",
        FlashingStatus::Finished => "Done",
    }
}

fn stage_msg(status: FlashingStatus, stage: usize) -> String {
    format!("[{stage}] {}", progress_msg(status))
}

/// Print the serial log until Ctrl-C or until the port goes away.
async fn stream_log(session: &mut CliSession) -> anyhow::Result<()> {
    let term = console::Term::stdout();
    let (tx, mut rx) = mpsc::channel(64);

    session.start_logging(Some(tx)).await?;
    if let Some(info) = session.device_info() {
        tracing::info!("Showing serial log of {info}, press Ctrl-C to stop");
    }

    let mut check = tokio::time::interval(LOG_CHECK_INTERVAL);
    loop {
        tokio::select! {
            text = rx.next() => match text {
                Some(x) => term.write_str(&x)?,
                None => break,
            },
            _ = check.tick() => {
                if session.log_ended() {
                    break;
                }
            }
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
        }
    }

    // Whatever the reader sent before it stopped
    while let Ok(Some(x)) = rx.try_next() {
        term.write_str(&x)?;
    }

    session.stop_logging().await?;
    Ok(())
}

/// Where to save the transcript, if anywhere. A bare `--save`, or a configured transcript
/// directory, picks a timestamped file name.
fn transcript_file(save: Option<Option<PathBuf>>, settings: &Settings) -> Option<PathBuf> {
    let file = match save {
        Some(Some(p)) => p,
        None if settings.transcript_dir.is_none() => return None,
        _ => default_file_name(chrono::Local::now()).into(),
    };

    Some(settings.transcript_path(file))
}

fn save_transcript(
    session: &CliSession,
    path: Option<PathBuf>,
    quiet: bool,
) -> anyhow::Result<()> {
    let Some(p) = path else {
        return Ok(());
    };

    if let Some(dir) = p.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    session
        .save_transcript(&p)
        .with_context(|| format!("Failed to save transcript to {}", p.display()))?;

    if !quiet {
        console::Term::stdout().write_line(&format!("Transcript saved to {}", p.display()))?;
    }
    Ok(())
}

fn config(
    action: ConfigCommands,
    mut settings: Settings,
    path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let term = console::Term::stdout();
    let path = path.context("No configuration directory on this system")?;

    match action {
        ConfigCommands::Show => {
            term.write_line(&format!("# {}", path.display()))?;
            term.write_line(&settings.to_string())?;
        }
        ConfigCommands::Set { key, value } => {
            settings.set(key, value);
            settings.save_to(&path)?;
        }
        ConfigCommands::Reset => Settings::default().save_to(&path)?,
    }

    Ok(())
}

fn generate_completion(target: clap_complete::Shell) {
    let mut cmd = Opt::command();
    const BIN_NAME: &str = env!("CARGO_BIN_NAME");

    clap_complete::generate(target, &mut cmd, BIN_NAME, &mut std::io::stdout())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_messages() {
        assert_eq!(stage_msg(FlashingStatus::Preparing, 1), "[1] Preparing");
        assert_eq!(
            stage_msg(FlashingStatus::FlashingProgress(0.3), 3),
            "[3] Flashing"
        );
    }

    #[tokio::test]
    async fn catalog_file_is_relative_base() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("catalog.json");
        std::fs::write(
            &p,
            br#"{ "devices": [ { "model": "gamma", "name": "Gamma", "boards": [
                { "version": "601", "firmwares": [ { "version": "v2.2.0", "path": "gamma.bin" } ] }
            ] } ] }"#,
        )
        .unwrap();

        let sources = Sources {
            catalog: Some(p.display().to_string()),
            ..Default::default()
        };
        let (catalog, base) = load_catalog(&sources).await.unwrap();

        assert_eq!(catalog.devices().len(), 1);
        assert_eq!(base, CatalogBase::Dir(dir.path().to_path_buf()));
    }

    #[tokio::test]
    async fn firmware_base_overrides() {
        let sources = Sources {
            firmware_base: Some("https://example.com/firmware/".into()),
            ..Default::default()
        };
        let (catalog, base) = load_catalog(&sources).await.unwrap();

        assert_eq!(catalog, Catalog::builtin());
        assert!(matches!(base, CatalogBase::Url(_)));
    }

    #[tokio::test]
    async fn local_image() {
        let opt = Opt::try_parse_from([
            "bitaxe-flasher",
            "flash",
            "--port",
            "COM3",
            "--local",
            "esp-miner.bin",
        ])
        .unwrap();

        let Commands::Flash { img, .. } = opt.command else {
            panic!("expected flash");
        };
        let picked = firmware_source(img, &Sources::default()).await.unwrap();

        assert!(matches!(picked.src, FirmwareSource::Local(_)));
        assert_eq!(picked.address, 0);
        assert!(picked.selection.is_none());
    }

    #[tokio::test]
    async fn catalog_image() {
        let dir = tempfile::tempdir().unwrap();
        let opt = Opt::try_parse_from([
            "bitaxe-flasher",
            "flash",
            "--port",
            "COM3",
            "--device",
            "supra",
            "--board",
            "402",
            "--firmware-base",
            "/srv/bitaxe",
        ])
        .unwrap();
        let sources = Sources {
            cache_dir: Some(dir.path().to_path_buf()),
            ..opt.sources
        };

        let Commands::Flash { img, .. } = opt.command else {
            panic!("expected flash");
        };
        let picked = firmware_source(img, &sources).await.unwrap();

        assert_eq!(
            PathBuf::from(picked.src.to_string()),
            PathBuf::from("/srv/bitaxe/firmware/supra/402/esp-miner-factory-402-v2.1.10.bin")
        );

        // Nothing is connected yet, so the catalog image is held back
        let session = Session::new(Arc::new(SystemPorts), Arc::new(EspFlasher::default()));
        let (catalog, selection) = picked.selection.as_ref().unwrap();
        assert!(selection.is_complete(catalog));
        assert!(ready_to_flash(&session, &picked).is_err());
    }

    #[test]
    fn custom_image_skips_selection() {
        let session = Session::new(Arc::new(SystemPorts), Arc::new(EspFlasher::default()));
        let picked = Picked::custom(FirmwareSource::Local(LocalFirmware::new(
            PathBuf::from("esp-miner.bin").into(),
        )));

        assert!(ready_to_flash(&session, &picked).is_ok());
    }

    #[test]
    fn transcript_destination() {
        let plain = Settings::default();
        assert_eq!(transcript_file(None, &plain), None);
        assert_eq!(
            transcript_file(Some(Some("run.txt".into())), &plain),
            Some(PathBuf::from("run.txt"))
        );

        let named = transcript_file(Some(None), &plain).unwrap();
        let name = named.to_str().unwrap();
        assert!(name.starts_with("bitaxe-log-") && name.ends_with(".txt"));

        let with_dir = Settings {
            transcript_dir: Some("/var/log/bitaxe".into()),
            ..Default::default()
        };
        let auto = transcript_file(None, &with_dir).unwrap();
        assert_eq!(auto.parent(), Some(std::path::Path::new("/var/log/bitaxe")));
        assert!(
            auto.file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("bitaxe-log-")
        );
    }

    #[tokio::test]
    async fn unknown_board() {
        let opt = Opt::try_parse_from([
            "bitaxe-flasher",
            "flash",
            "--port",
            "COM3",
            "--device",
            "max",
            "--board",
            "601",
        ])
        .unwrap();

        let Commands::Flash { img, .. } = opt.command else {
            panic!("expected flash");
        };
        let err = firmware_source(img, &Sources::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "Board version 601 is not available for max");
    }
}
