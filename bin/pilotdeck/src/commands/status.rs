use pilotdeck_core::{Config, Paths};
use pilotdeck_tools::browser::launcher::{find_browser_binary, BrowserEngine};

fn mark(ok: bool) -> &'static str {
    if ok {
        "✓"
    } else {
        "✗"
    }
}

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!("pilotdeck status");
    println!("================");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "(defaults)" }
    );
    let config = Config::load_or_default(&paths)?;

    println!();
    println!("Browser:");
    let engine = BrowserEngine::from_name(&config.browser.engine);
    match find_browser_binary(engine) {
        Some(bin) => println!("  {} {:<10} {}", mark(true), engine.name(), bin.display()),
        None => println!("  {} {:<10} not found", mark(false), engine.name()),
    }
    println!(
        "  Profile:   {}",
        paths.browser_profile_dir(&config.browser.session).display()
    );
    println!("  Headed:    {}", config.browser.headed);

    let server = &config.browser.inspection_server;
    let launcher_found = which::which(&server.command).is_ok();
    println!(
        "  Inspection server: {} {} {}",
        mark(launcher_found),
        server.name,
        std::iter::once(server.command.as_str())
            .chain(server.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    );

    println!();
    println!("Hooks:");
    println!("  before_tool: {}", config.hooks.before_tool.len());
    println!("  after_tool:  {}", config.hooks.after_tool.len());
    match config.webhook_url() {
        Some(url) => println!("  Webhook:     {}", url),
        None => println!("  Webhook:     (none, events are logged)"),
    }
    println!(
        "  Correlation: max {} pending, ttl {}s",
        config.correlation.max_entries, config.correlation.ttl_secs
    );
    Ok(())
}
