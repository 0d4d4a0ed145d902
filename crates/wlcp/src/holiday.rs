// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Holiday banner index sent to agents for editor theming.

use chrono::{Datelike, NaiveDate};

/// Which holiday theme applies on `date`.
///
/// | Index | Holiday          | Window                      |
/// |-------|------------------|-----------------------------|
/// | 1     | Halloween        | October                     |
/// | 2     | Christmas        | Dec 1 – Dec 25              |
/// | 3     | New Year         | Dec 26 – Jan 2              |
/// | 4     | Valentine's Day  | Feb 1 – Feb 14              |
/// | 5     | Easter           | Easter Sunday – month end   |
/// | 6     | Independence Day | Jun 30 – Jul 4              |
/// | 0     | none             |                             |
pub fn holiday_index(date: NaiveDate) -> u8 {
    let (month, day) = (date.month(), date.day());
    let easter = easter_sunday(date.year());

    match (month, day) {
        (10, _) => 1,
        (12, 1..=25) => 2,
        (12, _) | (1, 1..=2) => 3,
        (2, 1..=14) => 4,
        _ if easter.is_some_and(|e| month == e.month() && day >= e.day()) => 5,
        (6, 30) | (7, 1..=4) => 6,
        _ => 0,
    }
}

/// Gregorian Easter Sunday of `year`.
pub fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let golden = year % 19 + 1;
    let century = year / 100 + 1;
    // leap years skipped by the Gregorian reform
    let x = 3 * century / 4 - 12;
    // lunar orbit correction
    let y = (8 * century + 5) / 25 - 5;
    let sunday = 5 * year / 4 - x - 10;

    let mut epact = (11 * golden + 20 + y - x) % 30;
    if epact == 24 || (epact == 25 && golden > 11) {
        epact += 1;
    }

    let mut moon = 44 - epact;
    if moon < 21 {
        moon += 30;
    }

    let day = moon + 7 - (sunday + moon) % 7;
    if day > 31 {
        NaiveDate::from_ymd_opt(year, 4, (day - 31) as u32)
    } else {
        NaiveDate::from_ymd_opt(year, 3, day as u32)
    }
}
