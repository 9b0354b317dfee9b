use chrono::NaiveDate;

/// Date format used by Robinhood activity exports.
const FORMAT: &str = "%m/%d/%Y";

pub(crate) fn parse_date(raw: &str) -> std::result::Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(raw.trim(), FORMAT)
}
