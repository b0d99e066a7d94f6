mod ai;
mod cli;
mod config;
mod error;
mod gateway;
mod images;
mod logging;
#[cfg(test)]
mod test_support;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use ai::refine::NoopObserver;
use ai::{build_client, MapProxyClient, RefineObserver, RefineRequest, Refiner};
use cli::color::Palette;
use cli::console::{render_json, render_location, ConsoleObserver};
use cli::{Cli, Command, ConfigAction, LocateArgs};
use config::Settings;

/// 回答が得られなかった場合の終了コード
const EXIT_NO_ANSWER: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // .env ファイルから環境変数を読み込む
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // serve は標準エラー出力へ、それ以外はログファイルへ（_guard は main 終了まで保持する）
    let _guard = match &cli.command {
        Command::Serve { .. } => {
            logging::init_stderr_logging();
            None
        }
        _ => match logging::init_file_logging() {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("geolocatr: warning: logging disabled: {e:#}");
                None
            }
        },
    };
    info!(version = env!("CARGO_PKG_VERSION"), "geolocatr started");

    let result = match cli.command {
        Command::Locate(args) => run_locate(args).await,
        Command::Config { action } => run_config(action).map(|_| ExitCode::SUCCESS),
        Command::Serve { listen } => gateway::serve(listen, gateway::GatewayConfig::from_env())
            .await
            .map(|_| ExitCode::SUCCESS),
        Command::Ping { url } => run_ping(url).await.map(|_| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("geolocatr: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// コマンドライン引数で設定を上書きする。
fn apply_locate_overrides(settings: &mut Settings, args: &LocateArgs) {
    if let Some(kind) = args.provider {
        settings.provider.kind = kind;
    }
    if let Some(model) = &args.model {
        match settings.provider.kind {
            config::ProviderKind::OpenAI => settings.provider.model = model.clone(),
            config::ProviderKind::Gemini => settings.provider.function_model = model.clone(),
        }
    }
    if let Some(n) = args.max_iterations {
        settings.refine.max_iterations = n;
    }
    if let Some(context) = &args.context {
        settings.refine.context = context.clone();
    }
}

async fn run_locate(args: LocateArgs) -> Result<ExitCode> {
    let mut settings = Settings::load().with_env_overrides();
    apply_locate_overrides(&mut settings, &args);
    let palette = Palette::new(settings.theme);

    let images = images::load_images(&args.images)?;
    let model = build_client(&settings)?;
    let satellite = MapProxyClient::from_settings(&settings)?;
    let refiner = Refiner::new(
        model.as_ref(),
        &satellite,
        settings.refine.max_iterations,
        settings.refine.idle_timeout(),
    );
    let request = RefineRequest {
        images,
        context: settings.refine.context.clone(),
    };

    let mut observer: Box<dyn RefineObserver> = if args.json {
        Box::new(NoopObserver)
    } else {
        Box::new(ConsoleObserver::new(palette, args.quiet))
    };

    // Ctrl-C で実行中の問い合わせを打ち切る（会話は破棄される）
    let report = tokio::select! {
        report = refiner.run(&request, &mut *observer) => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Run interrupted by the user");
            eprintln!("\ngeolocatr: interrupted");
            return Ok(ExitCode::from(130));
        }
    };
    drop(observer);

    info!(
        answered = report.answer.is_some(),
        model_calls = report.model_calls,
        satellite_fetches = report.satellite_fetches,
        "Locate finished"
    );

    if args.json {
        println!("{}", render_json(&report)?);
    } else {
        match &report.answer {
            Some(location) => println!("\n{}", render_location(&palette, location)),
            None => println!(
                "\n{}",
                palette.warning(&format!(
                    "No answer after {} model calls.",
                    report.model_calls
                ))
            ),
        }
    }

    Ok(if report.answer.is_some() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_NO_ANSWER)
    })
}

fn run_config(action: ConfigAction) -> Result<()> {
    let path = Settings::config_path();
    match action {
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Show => {
            let settings = Settings::load_from(&path).with_env_overrides();
            print!("{}", settings.to_display_toml()?);
        }
        ConfigAction::Set { key, value } => {
            // 環境変数の値は書き戻さない
            let mut settings = Settings::load_from(&path);
            settings.set(&key, &value)?;
            settings
                .save_to(&path)
                .with_context(|| format!("failed to update {key}"))?;
            println!("{key} updated in {}", path.display());
        }
    }
    Ok(())
}

async fn run_ping(url: Option<String>) -> Result<()> {
    let base = match url {
        Some(url) => url,
        None => Settings::load().with_env_overrides().provider.functions_url,
    };
    let body = gateway::probe(&base).await?;
    println!("{body}");
    Ok(())
}
