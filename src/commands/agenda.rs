use alarmd_core::{AlarmdConfig, DateTime};
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use owo_colors::OwoColorize;

use crate::render::{Render, date_label};

pub async fn run(config: AlarmdConfig, from: Option<&str>, to: Option<&str>, json: bool) -> Result<()> {
    let tz = super::timezone(&config)?;
    let now = DateTime::now(tz);

    let begin = match from {
        Some(day) => parse_day(day, tz)?,
        None => now.start_of_day(),
    };
    let end = match to {
        Some(day) => parse_day(day, tz)?.add_days(1),
        None => *config.window.window_for(&begin)?.end(),
    };

    let engine = super::build_engine(&config, tz)?;
    let appointments = engine.query(&begin, &end, tz).await?;
    engine.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&appointments)?);
        return Ok(());
    }

    if appointments.is_empty() {
        println!("{}", "No appointments found".dimmed());
        return Ok(());
    }

    // Group by day
    let mut current_date: Option<String> = None;
    for appointment in &appointments {
        let label = date_label(&appointment.begin, &now);
        if current_date.as_ref() != Some(&label) {
            if current_date.is_some() {
                println!();
            }
            println!("{}", label.bold());
            current_date = Some(label);
        }
        println!("{}", appointment.render());
    }

    Ok(())
}

fn parse_day(day: &str, tz: Tz) -> Result<DateTime> {
    let date = NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", day))?;
    Ok(DateTime::from_local(tz, date.and_time(NaiveTime::MIN))?)
}
