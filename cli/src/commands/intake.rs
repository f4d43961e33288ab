use anyhow::Result;
use chrono::{Local, Utc};
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use buzz_core::decay::{half_life_ms, level_at};
use buzz_core::models::NewIntake;
use buzz_core::service::BuzzService;

use super::helpers::{json_error, local_time, parse_at, short_id, truncate};

pub(crate) fn cmd_log(
    svc: &BuzzService,
    amount: f64,
    name: Option<String>,
    category: &str,
    at: Option<&str>,
    json: bool,
) -> Result<()> {
    let at = at.map(|s| parse_at(s, &Local::now())).transpose()?;
    let intake = svc.log_intake(&NewIntake {
        name: name.unwrap_or_default(),
        amount,
        category: category.to_string(),
        at,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&intake)?);
        return Ok(());
    }

    println!(
        "Logged {:.0} mg {} ({}) at {} [{}]",
        intake.amount,
        intake.name,
        intake.category,
        local_time(intake.timestamp),
        short_id(&intake.client_id)
    );

    let status = svc.status(&Local::now())?;
    println!(
        "  Now: {:.0} mg in your system, {:.0} mg consumed today of {:.0} mg",
        status.current_level, status.consumed_today, status.daily_limit
    );
    if status.consumed_today > status.daily_limit {
        eprintln!("Warning: over your daily limit");
    }
    Ok(())
}

pub(crate) fn cmd_remove(svc: &BuzzService, key: &str, json: bool) -> Result<()> {
    if let Some(removed) = svc.remove_intake(key)? {
        if json {
            println!("{}", serde_json::json!({ "removed": removed.client_id }));
        } else {
            println!(
                "Removed {:.0} mg {} at {}",
                removed.amount,
                removed.name,
                local_time(removed.timestamp)
            );
        }
        Ok(())
    } else {
        if json {
            println!("{}", json_error(&format!("Intake {key} not found")));
        } else {
            eprintln!("Intake {key} not found");
        }
        process::exit(2);
    }
}

pub(crate) fn cmd_list(svc: &BuzzService, limit: usize, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct IntakeRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Time")]
        time: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "mg")]
        amount: String,
        #[tabled(rename = "Left")]
        remaining: String,
    }

    let intakes = svc.list_intakes(Some(limit))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&intakes)?);
        return Ok(());
    }

    if intakes.is_empty() {
        eprintln!("No intakes logged yet");
        process::exit(2);
    }

    let half_life = half_life_ms(&svc.settings()?);
    let now = Utc::now();
    let rows: Vec<IntakeRow> = intakes
        .iter()
        .map(|i| IntakeRow {
            id: short_id(&i.client_id).to_string(),
            time: local_time(i.timestamp),
            name: truncate(&i.name, 30),
            category: i.category.clone(),
            amount: format!("{:.0}", i.amount),
            remaining: format!("{:.0}", level_at(std::slice::from_ref(i), now, half_life)),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(4..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}
