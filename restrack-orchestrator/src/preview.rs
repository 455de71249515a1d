//! Dry-run rendering of a retirement selection.

use chrono::{DateTime, Duration, Utc};
use restrack_common::{ResourcePayload, TrackedResource};

use crate::retirement::Selection;

const HEADERS: [&str; 7] = ["NAME", "SITE", "STATUS", "CREATED", "AGE", "LAST SEEN", "DETAILS"];
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

pub fn format_age(age: Duration) -> String {
    let minutes = age.num_minutes().max(0);
    let (days, hours, mins) = (minutes / 1440, (minutes % 1440) / 60, minutes % 60);
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else {
        format!("{}m", mins)
    }
}

fn details(resource: &TrackedResource) -> String {
    match &resource.payload {
        ResourcePayload::Server(s) => s.flavor.clone().unwrap_or_default(),
        ResourcePayload::Subnet(s) => s.cidr.clone().unwrap_or_default(),
        ResourcePayload::FloatingIp(f) => f.floating_ip_address.clone().unwrap_or_default(),
        ResourcePayload::GpuLease(l) => l
            .end_date
            .map(|d| format!("ends {}", d.format(TIME_FORMAT)))
            .unwrap_or_default(),
        ResourcePayload::Network(_) | ResourcePayload::Router(_) => String::new(),
    }
}

fn row(resource: &TrackedResource, now: DateTime<Utc>) -> [String; 7] {
    let name = if resource.resource_name.is_empty() {
        resource.resource_id.clone()
    } else {
        resource.resource_name.clone()
    };
    [
        name,
        resource.site.to_string(),
        resource.status.clone(),
        resource
            .created_time
            .map(|t| t.format(TIME_FORMAT).to_string())
            .unwrap_or_else(|| "-".to_string()),
        resource
            .created_time
            .map(|t| format_age(now - t))
            .unwrap_or_else(|| "-".to_string()),
        resource.last_seen_time.format(TIME_FORMAT).to_string(),
        details(resource),
    ]
}

fn table(rows: &[[String; 7]]) -> String {
    let mut widths = HEADERS.map(str::len);
    for r in rows {
        for (w, cell) in widths.iter_mut().zip(r.iter()) {
            *w = (*w).max(cell.chars().count());
        }
    }
    let line = |cells: &[String]| {
        cells
            .iter()
            .zip(widths.iter())
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let header: Vec<String> = HEADERS.iter().map(|h| h.to_string()).collect();
    let mut out = vec![line(header.as_slice())];
    out.extend(rows.iter().map(|r| line(&r[..])));
    out.join("\n")
}

/// Human-readable preview: one table per kind, in deletion order.
pub fn render(selection: &Selection, now: DateTime<Utc>) -> String {
    let mut out = format!(
        "DRY RUN: {} resource(s) created before {} would be deleted\n",
        selection.total(),
        selection.cutoff.format(TIME_FORMAT)
    );
    for (kind, resources) in &selection.by_kind {
        out.push('\n');
        if resources.is_empty() {
            out.push_str(&format!("{}: none\n", kind.plural()));
            continue;
        }
        out.push_str(&format!("{} ({})\n", kind.plural(), resources.len()));
        let rows: Vec<[String; 7]> = resources.iter().map(|r| row(r, now)).collect();
        out.push_str(&table(&rows));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use restrack_common::payload::{ServerDetails, SubnetDetails};
    use restrack_common::{ResourceKind, Site};

    fn tracked(id: &str, name: &str, payload: ResourcePayload, created: DateTime<Utc>) -> TrackedResource {
        TrackedResource {
            resource_id: id.to_string(),
            resource_name: name.to_string(),
            status: "ACTIVE".to_string(),
            site: Site::ChiUc,
            created_time: Some(created),
            updated_time: None,
            last_seen_time: created,
            first_time_not_seen: None,
            payload,
        }
    }

    #[test]
    fn ages_are_compact() {
        assert_eq!(format_age(Duration::minutes(5)), "5m");
        assert_eq!(format_age(Duration::minutes(125)), "2h 5m");
        assert_eq!(format_age(Duration::hours(50)), "2d 2h");
        assert_eq!(format_age(Duration::minutes(-3)), "0m");
    }

    #[test]
    fn renders_one_table_per_kind_with_details() {
        let now = Utc.with_ymd_and_hms(2024, 5, 3, 12, 0, 0).unwrap();
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut selection = Selection::new(Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap());
        selection.push(tracked(
            "srv-1",
            "old-box",
            ResourcePayload::Server(ServerDetails {
                flavor: Some("baremetal".to_string()),
                ..Default::default()
            }),
            created,
        ));
        selection.push(tracked(
            "sub-1",
            "",
            ResourcePayload::Subnet(SubnetDetails {
                cidr: Some("10.0.0.0/24".to_string()),
                ..Default::default()
            }),
            created,
        ));
        selection.by_kind.insert(ResourceKind::Network, Vec::new());

        let text = render(&selection, now);
        assert!(text.starts_with("DRY RUN: 2 resource(s) created before 2024-05-02 12:00"));
        assert!(text.contains("servers (1)"));
        assert!(text.contains("networks: none"));
        assert!(text.contains("old-box"));
        assert!(text.contains("baremetal"));
        assert!(text.contains("2d 0h"));
        // Unnamed resources fall back to their id.
        assert!(text.contains("sub-1"));
        assert!(text.contains("10.0.0.0/24"));
        assert!(text.find("servers").unwrap() < text.find("networks").unwrap());
        assert!(text.find("networks").unwrap() < text.find("subnets").unwrap());
    }
}
