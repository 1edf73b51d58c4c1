//! `ls -l` line parser.
//!
//! Remote classes that list directories by running `ls` on the other side
//! feed each line through [`parse_ls_line`] from their `dir_load`. Handles
//! the three common date layouts, device numbers in place of the size,
//! listings without a group column, names with spaces and `name -> target`
//! symlinks.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use std::time::SystemTime;

use crate::types::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFREG, S_IFSOCK, Stat};

/// One parsed listing line.
#[derive(Debug, Clone, PartialEq)]
pub struct LsEntry {
    pub name: String,
    /// Symlink target, for `l` lines that carry one.
    pub linkname: Option<String>,
    pub owner: String,
    pub group: Option<String>,
    /// Mode, link count, size or device, uid/gid when numeric, and times.
    pub st: Stat,
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Parse a permission string such as `drwxr-sr-t` into mode bits.
pub fn parse_mode(perm: &str) -> Option<u32> {
    let bytes = perm.as_bytes();
    if bytes.len() < 10 {
        return None;
    }
    let kind = match bytes[0] {
        b'-' | b'f' => S_IFREG,
        b'd' => S_IFDIR,
        b'l' => S_IFLNK,
        b'c' => S_IFCHR,
        b'b' => S_IFBLK,
        b'p' => S_IFIFO,
        b's' => S_IFSOCK,
        _ => return None,
    };

    let mut mode = 0u32;
    for (i, (&c, bit)) in bytes[1..10]
        .iter()
        .zip([0o400, 0o200, 0o100, 0o040, 0o020, 0o010, 0o004, 0o002, 0o001])
        .enumerate()
    {
        let special = [0o4000, 0o2000, 0o1000][i / 3];
        match (i % 3, c) {
            (_, b'-') => {}
            (0, b'r') | (1, b'w') | (2, b'x') => mode |= bit,
            (2, b's') if i != 8 => mode |= bit | special,
            (2, b'S') if i != 8 => mode |= special,
            (2, b't') if i == 8 => mode |= bit | special,
            (2, b'T') if i == 8 => mode |= special,
            _ => return None,
        }
    }
    Some(kind | mode)
}

fn month(token: &str) -> Option<u32> {
    MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(token))
        .map(|i| i as u32 + 1)
}

fn is_iso_date(token: &str) -> bool {
    NaiveDate::parse_from_str(token, "%Y-%m-%d").is_ok()
}

fn local_time(when: NaiveDateTime) -> Option<SystemTime> {
    Local
        .from_local_datetime(&when)
        .earliest()
        .map(SystemTime::from)
}

/// Parse `Mon DD HH:MM` or `Mon DD YYYY`. A date without a year is taken
/// from the last twelve months.
fn parse_month_date(mon: &str, day: &str, third: &str, now: NaiveDateTime) -> Option<SystemTime> {
    let month = month(mon)?;
    let day: u32 = day.parse().ok()?;
    if let Ok(year) = third.parse::<i32>() {
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        return local_time(date.and_time(NaiveTime::from_hms_opt(0, 0, 0)?));
    }
    let time = NaiveTime::parse_from_str(third, "%H:%M").ok()?;
    let mut date = NaiveDate::from_ymd_opt(now.year(), month, day)?;
    if date.and_time(time) > now + chrono::Duration::days(1) {
        date = NaiveDate::from_ymd_opt(now.year() - 1, month, day)?;
    }
    local_time(date.and_time(time))
}

fn parse_iso_date(date: &str, time: &str) -> Option<SystemTime> {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    let time = NaiveTime::parse_from_str(time, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M:%S"))
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M:%S%.f"))
        .ok()?;
    local_time(date.and_time(time))
}

/// Whitespace-separated fields with their byte offsets.
fn fields(line: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in line.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                out.push((s, &line[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, &line[s..]));
    }
    out
}

/// Parse one `ls -l` line. Returns `None` for `total` lines and anything
/// that does not look like a listing entry.
pub fn parse_ls_line(line: &str) -> Option<LsEntry> {
    parse_ls_line_at(line, Local::now().naive_local())
}

/// [`parse_ls_line`] with an explicit "now" for dates without a year.
pub fn parse_ls_line_at(line: &str, now: NaiveDateTime) -> Option<LsEntry> {
    let line = line.trim_end_matches(['\n', '\r']);
    let f = fields(line);
    if f.len() < 6 {
        return None;
    }
    let mode = parse_mode(f[0].1)?;
    let nlink: u64 = f[1].1.parse().ok()?;

    // The date is the first month name or ISO date after owner and size.
    let date_at = (3..f.len()).find(|&i| {
        let t = f[i].1;
        (month(t).is_some() && i + 2 < f.len()) || (is_iso_date(t) && i + 1 < f.len())
    })?;
    let iso = month(f[date_at].1).is_none();
    let (mtime, name_at) = if iso {
        (parse_iso_date(f[date_at].1, f[date_at + 1].1)?, date_at + 2)
    } else {
        (
            parse_month_date(f[date_at].1, f[date_at + 1].1, f[date_at + 2].1, now)?,
            date_at + 3,
        )
    };
    let (name_start, _) = *f.get(name_at)?;

    let device = mode & 0o170000 == S_IFCHR || mode & 0o170000 == S_IFBLK;
    let (size, rdev, size_at) = if device {
        let last = f[date_at - 1].1;
        let (major, minor, at) = match last.split_once(',') {
            Some((major, minor)) if !minor.is_empty() => (major, minor, date_at - 1),
            _ => (f[date_at - 2].1.trim_end_matches(','), last, date_at - 2),
        };
        let major: u32 = major.parse().ok()?;
        let minor: u32 = minor.parse().ok()?;
        (0, libc::makedev(major, minor), at)
    } else {
        (f[date_at - 1].1.parse::<u64>().ok()?, 0, date_at - 1)
    };

    let owner = f[2].1.to_string();
    let group = (size_at > 3).then(|| f[3].1.to_string());

    let rest = &line[name_start..];
    let (name, linkname) = match (mode & 0o170000 == S_IFLNK, rest.split_once(" -> ")) {
        (true, Some((name, target))) => (name.to_string(), Some(target.to_string())),
        _ => (rest.to_string(), None),
    };
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }

    let st = Stat {
        mode,
        nlink,
        uid: owner.parse().unwrap_or(0),
        gid: group.as_deref().and_then(|g| g.parse().ok()).unwrap_or(0),
        rdev,
        size,
        blocks: size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        ..Stat::default()
    };

    Some(LsEntry {
        name,
        linkname,
        owner,
        group,
        st,
    })
}
