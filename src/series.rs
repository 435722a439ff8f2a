use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub name: String,
    pub data: Vec<Point>,
}

/// Find a metric inside a bulk response.
///
/// `metrics/cpu/cpu_user` walks `response["metrics"]["cpu"]["cpu_user"]`; a
/// trailing `[from,to,step]` suffix is ignored.
pub fn lookup<'a>(response: &'a Value, field: &str) -> Option<&'a Value> {
    let path = field.split('[').next().unwrap_or(field);
    path.split('/')
        .filter(|seg| !seg.is_empty())
        .try_fold(response, |node, seg| node.get(seg))
}

/// Last path segment, used when a series has no better name.
pub fn display_name(field: &str) -> &str {
    let path = field.split('[').next().unwrap_or(field);
    path.rsplit('/').next().unwrap_or(path)
}

// Values come as [[y, x], ...] with x in epoch seconds. A bare number means
// "this value for the whole last hour"; a string holds JSON of either shape.
pub fn transform_data(value: &Value, display_name: &str, now: i64, tz_offset: i64) -> Option<Series> {
    let data = match value {
        Value::Null => return None,
        Value::String(s) => {
            let parsed: Value = serde_json::from_str(s).ok()?;
            if parsed.is_string() {
                return None;
            }
            return transform_data(&parsed, display_name, now, tz_offset);
        }
        Value::Number(n) => {
            let y = n.as_f64()?;
            vec![
                Point { x: (now - 3600 + tz_offset) as f64, y },
                Point { x: (now + tz_offset) as f64, y },
            ]
        }
        Value::Array(rows) => rows
            .iter()
            .filter_map(|row| {
                let pair = row.as_array()?;
                let y = pair.first()?.as_f64()?;
                let x = pair.get(1)?.as_f64()?;
                Some(Point { x: x + tz_offset as f64, y })
            })
            .collect(),
        _ => return None,
    };

    Some(Series {
        name: display_name.to_string(),
        data,
    })
}

/// True when there is at least one series and every series has a first point.
pub fn check_series(series: &[Series]) -> bool {
    !series.is_empty() && series.iter().all(|s| !s.data.is_empty())
}
