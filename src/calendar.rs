use crate::structs::DateDimensionRow;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use std::ops::RangeInclusive;

/// Answers whether a calendar date is a recognized holiday.
pub trait HolidayCalendar: Send + Sync {
    fn is_holiday(&self, date: NaiveDate) -> bool;
}

/// A holiday occurrence in a given year.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holiday {
    pub date: NaiveDate,
    pub name: &'static str,
    /// True for the weekday a weekend holiday is moved to.
    pub observed: bool,
}

/// United States federal holidays, including observed dates.
///
/// Fixed-date holidays falling on a Saturday are observed the Friday before,
/// those on a Sunday the Monday after. Years outside [`Self::COVERED_YEARS`]
/// have no holidays.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsFederalHolidays;

impl UsFederalHolidays {
    pub const COVERED_YEARS: RangeInclusive<i32> = 1871..=9999;

    /// All holidays whose date (actual or observed) falls in `year`, in date order.
    pub fn holidays_in_year(&self, year: i32) -> Vec<Holiday> {
        if !Self::COVERED_YEARS.contains(&year) {
            return Vec::new();
        }

        let mut holidays = Vec::with_capacity(16);
        let fixed = |holidays: &mut Vec<Holiday>, month: u32, day: u32, name: &'static str| {
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                push_with_observed(holidays, date, name);
            }
        };
        let floating = |holidays: &mut Vec<Holiday>, date: Option<NaiveDate>, name: &'static str| {
            if let Some(date) = date {
                holidays.push(Holiday {
                    date,
                    name,
                    observed: false,
                });
            }
        };

        fixed(&mut holidays, 1, 1, "New Year's Day");

        if year >= 1986 {
            floating(
                &mut holidays,
                nth_weekday(year, 1, Weekday::Mon, 3),
                "Martin Luther King Jr. Day",
            );
        }

        if year >= 1971 {
            floating(
                &mut holidays,
                nth_weekday(year, 2, Weekday::Mon, 3),
                "Washington's Birthday",
            );
        } else if year >= 1879 {
            fixed(&mut holidays, 2, 22, "Washington's Birthday");
        }

        if year >= 1971 {
            floating(
                &mut holidays,
                last_weekday(year, 5, Weekday::Mon),
                "Memorial Day",
            );
        } else if year >= 1888 {
            fixed(&mut holidays, 5, 30, "Memorial Day");
        }

        if year >= 2021 {
            fixed(&mut holidays, 6, 19, "Juneteenth National Independence Day");
        }

        fixed(&mut holidays, 7, 4, "Independence Day");

        if year >= 1894 {
            floating(
                &mut holidays,
                nth_weekday(year, 9, Weekday::Mon, 1),
                "Labor Day",
            );
        }

        if year >= 1971 {
            floating(
                &mut holidays,
                nth_weekday(year, 10, Weekday::Mon, 2),
                "Columbus Day",
            );
        } else if year >= 1937 {
            fixed(&mut holidays, 10, 12, "Columbus Day");
        }

        if (1971..=1977).contains(&year) {
            floating(
                &mut holidays,
                nth_weekday(year, 10, Weekday::Mon, 4),
                "Veterans Day",
            );
        } else if year >= 1938 {
            fixed(&mut holidays, 11, 11, "Veterans Day");
        }

        floating(
            &mut holidays,
            nth_weekday(year, 11, Weekday::Thu, 4),
            "Thanksgiving",
        );

        fixed(&mut holidays, 12, 25, "Christmas Day");

        // Next year's New Year's Day is observed on Dec 31 when it is a Saturday.
        if Self::COVERED_YEARS.contains(&(year + 1)) {
            if let Some(next_new_year) = NaiveDate::from_ymd_opt(year + 1, 1, 1) {
                if next_new_year.weekday() == Weekday::Sat {
                    holidays.push(Holiday {
                        date: next_new_year - Duration::days(1),
                        name: "New Year's Day",
                        observed: true,
                    });
                }
            }
        }

        holidays.retain(|holiday| holiday.date.year() == year);
        holidays.sort_by_key(|holiday| holiday.date);
        holidays
    }
}

impl HolidayCalendar for UsFederalHolidays {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays_in_year(date.year())
            .iter()
            .any(|holiday| holiday.date == date)
    }
}

fn push_with_observed(holidays: &mut Vec<Holiday>, date: NaiveDate, name: &'static str) {
    holidays.push(Holiday {
        date,
        name,
        observed: false,
    });
    let shift = match date.weekday() {
        Weekday::Sat => -1,
        Weekday::Sun => 1,
        _ => return,
    };
    holidays.push(Holiday {
        date: date + Duration::days(shift),
        name,
        observed: true,
    });
}

/// The `n`-th (1-based) `weekday` of a month.
fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    nth_weekday(year, month, weekday, 5).or_else(|| nth_weekday(year, month, weekday, 4))
}

/// Full US English weekday name.
pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Derives every dimension attribute of `date`.
///
/// Pure: the result depends only on `date` and the holiday calendar.
pub fn enrich_date(date: NaiveDate, holidays: &dyn HolidayCalendar) -> DateDimensionRow {
    let year = date.year();
    let month = date.month();
    let day = date.day();
    let weekday = date.weekday();

    DateDimensionRow {
        calendar_date: date,
        date_key: i64::from(year) * 10_000 + i64::from(month * 100 + day),
        day,
        month,
        year,
        weekday_name: weekday_name(weekday),
        week_of_year: date.iso_week().week(),
        quarter: (month - 1) / 3 + 1,
        is_weekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
        is_holiday: holidays.is_holiday(date),
    }
}
