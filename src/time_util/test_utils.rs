use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or_else(|| panic!("Invalid date: {}-{}-{}", year, month, day))
}

pub fn time(hour: u32, minute: u32, second: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, second)
        .unwrap_or_else(|| panic!("Invalid time: {}:{}:{}", hour, minute, second))
}

pub fn datetime(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> NaiveDateTime {
    date(year, month, day).and_time(time(hour, minute, second))
}
