mod analytics;
mod report;
mod settings;
mod web;

use std::process::exit;

use analytics::GoogleAnalytics;
use clap::Parser;
use report::property_name;
use settings::{Args, Settings};
use tracing::{error, info, warn};
use web::ReportContext;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    info!("GA4 Report Server");

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!("Problem while loading .env file. {e}");
        }
    }

    let args = Args::parse();
    let settings = match Settings::load(args.config.as_deref()) {
        Ok(ret) => ret,
        Err(error) => {
            error!("Problem while loading settings. {error}");
            exit(1);
        }
    };

    let client = match GoogleAnalytics::new(&settings.analytics) {
        Ok(ret) => ret,
        Err(error) => {
            error!("Problem while creating the analytics client. {error:#}");
            exit(1);
        }
    };

    let context = ReportContext {
        client,
        property: property_name(&settings.analytics.property_id),
    };
    web::serve(context, settings.web.address).await;
}
