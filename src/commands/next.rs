use alarmd_core::alarm_queue::qualifies;
use alarmd_core::{AlarmdConfig, DateTime};
use anyhow::Result;
use owo_colors::OwoColorize;

pub async fn run(config: AlarmdConfig) -> Result<()> {
    let tz = super::timezone(&config)?;
    let now = DateTime::now(tz);
    let window = config.window.window_for(&now)?;

    let engine = super::build_engine(&config, tz)?;
    let appointments = engine.query_window(&window, tz).await;
    engine.shutdown();

    // Same rule as the daemon: nothing earlier than the current minute fires
    let minute = now.minute_index();
    let next = appointments
        .iter()
        .filter(|a| qualifies(a))
        .flat_map(|a| a.alarms.iter().map(move |alarm| (a, alarm)))
        .filter(|(_, alarm)| alarm.time.minute_index() >= minute)
        .min_by(|x, y| x.1.time.cmp(&y.1.time).then_with(|| x.0.uid.cmp(&y.0.uid)));

    match next {
        Some((appointment, alarm)) => {
            let text = if alarm.text.is_empty() {
                &appointment.summary
            } else {
                &alarm.text
            };
            println!(
                "{} {} {}",
                alarm.time.format("%a %b %-d %H:%M").bold(),
                text,
                format!("(in {})", humanize(now.until(&alarm.time))).dimmed()
            );
        }
        None => println!("{}", format!("No alarms before {}", window.end().format("%a %b %-d")).dimmed()),
    }

    Ok(())
}

fn humanize(delta: chrono::Duration) -> String {
    let minutes = delta.num_minutes().max(0);
    match (minutes / 1440, (minutes % 1440) / 60, minutes % 60) {
        (0, 0, m) => format!("{}m", m),
        (0, h, m) => format!("{}h {}m", h, m),
        (d, h, _) => format!("{}d {}h", d, h),
    }
}
