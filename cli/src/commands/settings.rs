use anyhow::{Result, bail};
use tabled::{Table, Tabled, settings::Style};

use buzz_core::decay::half_life_hours;
use buzz_core::models::{Settings, SettingsPatch};
use buzz_core::service::BuzzService;

fn yes_no(v: bool) -> String {
    if v { "yes" } else { "no" }.to_string()
}

fn print_settings(settings: &Settings) {
    #[derive(Tabled)]
    struct SettingRow {
        #[tabled(rename = "Setting")]
        name: &'static str,
        #[tabled(rename = "Value")]
        value: String,
    }

    let rows = vec![
        SettingRow {
            name: "Metabolism",
            value: settings.metabolism_rate.to_string(),
        },
        SettingRow {
            name: "Daily limit",
            value: format!("{:.0} mg", settings.caffeine_limit),
        },
        SettingRow {
            name: "Bedtime",
            value: settings.bedtime.to_string(),
        },
        SettingRow {
            name: "Sleep target",
            value: format!("{:.0} mg", settings.target_sleep_caffeine),
        },
        SettingRow {
            name: "Pregnancy",
            value: yes_no(settings.pregnancy_adjustment),
        },
        SettingRow {
            name: "Smoker",
            value: yes_no(settings.smoker_adjustment),
        },
        SettingRow {
            name: "Oral contraceptive",
            value: yes_no(settings.oral_contraceptive_adjustment),
        },
        SettingRow {
            name: "Half-life",
            value: format!("{:.2} h", half_life_hours(settings)),
        },
    ];

    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
}

pub(crate) fn cmd_settings_show(svc: &BuzzService, json: bool) -> Result<()> {
    let settings = svc.settings()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
    } else {
        print_settings(&settings);
    }
    Ok(())
}

pub(crate) fn cmd_settings_set(svc: &BuzzService, patch: &SettingsPatch, json: bool) -> Result<()> {
    if patch.is_empty() {
        bail!(
            "Nothing to update. Provide at least one of --metabolism, --limit, --bedtime, --sleep-target, --pregnancy, --smoker or --oral-contraceptive"
        );
    }

    let settings = svc.update_settings(patch)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
    } else {
        println!("Settings updated");
        print_settings(&settings);
    }
    Ok(())
}

pub(crate) fn cmd_settings_reset(svc: &BuzzService, json: bool) -> Result<()> {
    let settings = svc.reset_settings()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
    } else {
        println!("Settings reset to defaults");
        print_settings(&settings);
    }
    Ok(())
}
