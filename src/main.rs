use std::path::Path;

use lung::experiments::assays;
use lung::observer::BodyAdapter;
use lung::prelude::*;
use tracing::{error, info, warn};

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut command: Option<&str> = None;
    let mut config_path: Option<&str> = None;
    let mut save_path: Option<&str> = None;
    let mut max_image_bytes: Option<usize> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" | "help" => {
                print_help();
                return;
            }
            "--config" => {
                let Some(path) = args.get(i + 1) else {
                    eprintln!("--config needs a path");
                    std::process::exit(2);
                };
                config_path = Some(path.as_str());
                i += 1;
            }
            "--save" => {
                let Some(path) = args.get(i + 1) else {
                    eprintln!("--save needs a path");
                    std::process::exit(2);
                };
                save_path = Some(path.as_str());
                i += 1;
            }
            "--max-image-bytes" => {
                let Some(n) = args.get(i + 1).and_then(|v| v.parse().ok()) else {
                    eprintln!("--max-image-bytes needs a byte count");
                    std::process::exit(2);
                };
                max_image_bytes = Some(n);
                i += 1;
            }
            other if command.is_none() => command = Some(other),
            other => {
                eprintln!("Unexpected argument: {other}");
                print_help();
                std::process::exit(2);
            }
        }
        i += 1;
    }

    let cfg = match config_path {
        Some(p) => match load_config(Path::new(p)) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("could not load config {p}: {e}");
                std::process::exit(1);
            }
        },
        None => BodyConfig {
            lung: LungConfig::default().with_seed(7).with_learning_rate(0.05),
            ..Default::default()
        },
    };

    let result = match command.unwrap_or("demo") {
        "demo" => run_demo(cfg).and_then(|body| match save_path {
            Some(p) => save_image(&body, Path::new(p), max_image_bytes),
            None => Ok(()),
        }),
        "assays" => assays::run().map(|_| ()).map_err(Into::into),
        other => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(2);
        }
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

fn print_help() {
    println!("lung (bidirectional attention kernel + dark matter memory)");
    println!("usage:");
    println!("  cargo run -- [demo] [--config body.json] [--save body.img] [--max-image-bytes N]");
    println!("  cargo run -- assays");
    println!("  cargo run -- --help");
}

fn load_config(path: &Path) -> Result<BodyConfig, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let cfg = BodyConfig::from_json_str(&raw)?;
    cfg.validate()?;
    info!("loaded config from {}", path.display());
    Ok(cfg)
}

/// Byte-level loop: train next-byte prediction on a short corpus, inject
/// every line as a stimulus, and let memory fade between epochs.
fn run_demo(cfg: BodyConfig) -> Result<Body, Box<dyn std::error::Error>> {
    const CORPUS: &str = "the lung breathes in both directions\n\
                          what it rejects becomes dark matter\n\
                          scars fade but the field remembers\n";

    let mut body = Body::new(cfg)?;
    let ctx_len = body.lung.ctx_len();
    let bytes: Vec<TokenId> = CORPUS.bytes().map(TokenId::from).collect();

    info!(
        vocab = body.lung.vocab_size(),
        d_model = body.lung.d_model(),
        ctx_len,
        heads = body.lung.n_heads(),
        "demo start"
    );

    let (mut x, mut y) = (16.0f32, 16.0f32);
    for epoch in 0..8 {
        let mut loss_sum = 0.0;
        let mut n = 0usize;
        for end in 1..bytes.len() {
            let start = end.saturating_sub(ctx_len);
            let context = &bytes[start..end];
            if !body.lung.can_train() {
                body.forward(context);
            }
            loss_sum += body.train_step(context, bytes[end])?.loss;
            n += 1;
        }

        for (k, line) in CORPUS.lines().enumerate() {
            let tokens: Vec<TokenId> = line.bytes().map(TokenId::from).collect();
            let pulse = FieldPulse {
                drift: 0.1 * k as f32,
                dissonance: if epoch % 2 == 0 { 0.0 } else { 0.5 },
            };
            let inj = body.inject(&tokens, pulse);
            let (gx, gy) = body.gradient(x, y);
            x += inj.dx + 0.01 * gx;
            y += inj.dy + 0.01 * gy;
            if !inj.accepted {
                warn!(line = k, scar_mass = inj.scar_mass, "line rejected");
            }
        }
        for _ in 0..25 {
            body.tick();
        }

        info!(
            epoch,
            mean_loss = loss_sum / n.max(1) as f32,
            scars = body.dark_matter.len(),
            x,
            y,
            "epoch done"
        );
    }

    let snapshot = BodyAdapter::new(&body).snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(body)
}

fn save_image(
    body: &Body,
    path: &Path,
    max_bytes: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = body.save_image_bounded(max_bytes)?;
    std::fs::write(path, &bytes)?;
    info!(bytes = bytes.len(), "saved image to {}", path.display());
    Ok(())
}
