// twsdl/src/protocol_dec_parser.rs
// Cursor over the NUL terminated fields of one incoming message

use crate::base::TwsDlError;

pub struct FieldParser<'a> {
  data: &'a [u8],
  fields: Vec<(usize, usize)>,
  next: usize,
}

impl<'a> FieldParser<'a> {
  pub fn new(data: &'a [u8]) -> Self {
    let mut fields = Vec::new();
    let mut start = 0;
    for (i, b) in data.iter().enumerate() {
      if *b == 0 {
        fields.push((start, i));
        start = i + 1;
      }
    }
    Self { data, fields, next: 0 }
  }

  fn field(&self, idx: usize) -> Result<&'a str, TwsDlError> {
    let (start, end) = *self.fields.get(idx)
      .ok_or_else(|| TwsDlError::ParseError(format!("message ends before field {}", idx)))?;
    std::str::from_utf8(&self.data[start..end])
      .map_err(|e| TwsDlError::ParseError(format!("field {} is not utf-8: {}", idx, e)))
  }

  pub fn read_str(&mut self) -> Result<&'a str, TwsDlError> {
    let s = self.field(self.next)?;
    self.next += 1;
    Ok(s)
  }

  pub fn read_string(&mut self) -> Result<String, TwsDlError> {
    self.read_str().map(str::to_string)
  }

  /// Empty fields read as 0.
  pub fn read_int(&mut self) -> Result<i32, TwsDlError> {
    let s = self.read_str()?;
    if s.is_empty() {
      return Ok(0);
    }
    s.parse::<i32>().map_err(|e| TwsDlError::ParseError(format!("bad int '{}': {}", s, e)))
  }

  pub fn read_i64(&mut self) -> Result<i64, TwsDlError> {
    let s = self.read_str()?;
    if s.is_empty() {
      return Ok(0);
    }
    s.parse::<i64>().map_err(|e| TwsDlError::ParseError(format!("bad long '{}': {}", s, e)))
  }

  /// Quantities are integers at this protocol version but some servers send
  /// decimals anyway.
  pub fn read_quantity(&mut self) -> Result<f64, TwsDlError> {
    self.read_double()
  }

  pub fn read_double(&mut self) -> Result<f64, TwsDlError> {
    let s = self.read_str()?;
    if s.is_empty() {
      return Ok(0.0);
    }
    s.parse::<f64>().map_err(|e| TwsDlError::ParseError(format!("bad double '{}': {}", s, e)))
  }

  pub fn read_bool(&mut self) -> Result<bool, TwsDlError> {
    Ok(self.read_int()? != 0)
  }

  pub fn peek_str(&self) -> Result<&'a str, TwsDlError> {
    self.field(self.next)
  }

  pub fn skip(&mut self, n: usize) -> Result<(), TwsDlError> {
    if self.next + n > self.fields.len() {
      return Err(TwsDlError::ParseError(format!("cannot skip {} fields, {} left", n, self.remaining())));
    }
    self.next += n;
    Ok(())
  }

  pub fn remaining(&self) -> usize {
    self.fields.len().saturating_sub(self.next)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_reads_fields_in_order() {
    let msg = b"17\0abc\0\0-3\01.5\0123456789012\0";
    let mut p = FieldParser::new(msg);
    assert_eq!(p.remaining(), 6);
    assert_eq!(p.peek_str().unwrap(), "17");
    assert_eq!(p.read_int().unwrap(), 17);
    assert_eq!(p.read_string().unwrap(), "abc");
    assert_eq!(p.read_double().unwrap(), 0.0);
    assert_eq!(p.read_int().unwrap(), -3);
    assert_eq!(p.read_double().unwrap(), 1.5);
    assert_eq!(p.read_i64().unwrap(), 123456789012);
    assert!(p.read_str().is_err());
  }

  #[test]
  fn test_bad_number_and_skip() {
    let mut p = FieldParser::new(b"x\0a\0b\0");
    assert!(p.read_int().is_err());
    assert!(p.skip(3).is_err());
    p.skip(2).unwrap();
    assert_eq!(p.remaining(), 0);
  }
}
