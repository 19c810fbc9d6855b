// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Control file stanzas as found in `Packages` and `Sources` indices.

Index files are a series of *paragraphs* (stanzas) separated by blank lines.
Each paragraph is an ordered series of `Name: value` fields. A line that does
not start with a field name is a continuation of the previous field and is
appended to its value after a newline.

The set of fields in a paragraph is open ended, so [ControlParagraph] is an
ordered field bag rather than a fixed struct. Unknown fields are retained.
*/

use {
    crate::error::Result,
    std::{borrow::Cow, io::BufRead},
};

/// A field in a control paragraph.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ControlField<'a> {
    name: Cow<'a, str>,
    value: Cow<'a, str>,
}

impl<'a> ControlField<'a> {
    /// Construct an instance from a field name and value.
    pub fn new(name: Cow<'a, str>, value: Cow<'a, str>) -> Self {
        Self { name, value }
    }

    /// The name of this field.
    pub fn name(&self) -> &str {
        self.name.as_ref()
    }

    /// Obtain the value as a [&str].
    ///
    /// Continuation lines are included verbatim, separated by `\n`.
    pub fn value_str(&self) -> &str {
        self.value.as_ref()
    }

    /// Obtain an iterator of words in the value.
    pub fn iter_words(&self) -> impl Iterator<Item = &str> {
        self.value.split_ascii_whitespace()
    }

    /// Obtain an iterator of lines in the value.
    ///
    /// Leading whitespace from each line is stripped. Empty lines are skipped.
    pub fn iter_lines(&self) -> impl Iterator<Item = &str> {
        self.value
            .lines()
            .map(|x| x.trim())
            .filter(|x| !x.is_empty())
    }
}

/// A paragraph in a control file.
///
/// A paragraph is an ordered series of control fields.
///
/// Field names are case insensitive on read and case preserving on set.
/// Setting a field that already exists replaces the old value.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ControlParagraph<'a> {
    fields: Vec<ControlField<'a>>,
}

impl<'a> ControlParagraph<'a> {
    /// Whether the paragraph is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set the value of a field via a [ControlField].
    pub fn set_field(&mut self, field: ControlField<'a>) {
        self.fields
            .retain(|cf| !cf.name.eq_ignore_ascii_case(&field.name));
        self.fields.push(field);
    }

    /// Set the value of a field defined via strings.
    pub fn set_field_from_string(&mut self, name: Cow<'a, str>, value: Cow<'a, str>) {
        self.set_field(ControlField::new(name, value));
    }

    /// Whether a named field is present in this paragraph.
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Iterate over fields in this paragraph.
    ///
    /// Iteration order is insertion order.
    pub fn iter_fields(&self) -> impl Iterator<Item = &ControlField<'a>> {
        self.fields.iter()
    }

    /// Obtain the field with a given name in this paragraph.
    pub fn field(&self, name: &str) -> Option<&'_ ControlField<'a>> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Obtain the raw string value of the named field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value_str())
    }

    /// Obtain the raw string value of the named field or a default if it is absent.
    pub fn field_str_or<'s>(&'s self, name: &str, default: &'s str) -> &'s str {
        self.field_str(name).unwrap_or(default)
    }

    /// Obtain an iterator of lines in the named field.
    pub fn field_iter_value_lines(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field(name).map(|f| f.iter_lines())
    }
}

/// Split a line into `(name, value)` if it begins a new field.
///
/// Field names consist of word characters and `-` and are immediately followed by `:`.
fn split_field_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;

    if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        Some((name, value))
    } else {
        None
    }
}

/// Holds parsing state for control files.
///
/// Instances are fed lines of text and periodically emit [ControlParagraph]
/// instances as they are completed.
#[derive(Clone, Debug, Default)]
pub struct ControlFileParser {
    paragraph: ControlParagraph<'static>,
    field: Option<(String, String)>,
}

impl ControlFileParser {
    /// Write a line to the parser.
    ///
    /// If the line terminates an in-progress paragraph, that paragraph is returned.
    pub fn write_line(&mut self, line: &str) -> Option<ControlParagraph<'static>> {
        let line = line.trim_end_matches(|c| c == '\n' || c == '\r');

        if line.trim().is_empty() {
            self.flush_field();

            return if self.paragraph.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.paragraph))
            };
        }

        if let Some((name, value)) = split_field_line(line) {
            self.flush_field();
            self.field = Some((name.to_string(), value.trim_start_matches(' ').to_string()));
        } else if let Some((_, value)) = self.field.as_mut() {
            value.push('\n');
            value.push_str(line);
        }
        // Continuation lines before the first field have nothing to attach to.

        None
    }

    /// Finish parsing, consuming self.
    ///
    /// If a non-empty paragraph is pending it is returned.
    pub fn finish(mut self) -> Option<ControlParagraph<'static>> {
        self.flush_field();

        if self.paragraph.is_empty() {
            None
        } else {
            Some(self.paragraph)
        }
    }

    fn flush_field(&mut self) {
        if let Some((name, value)) = self.field.take() {
            self.paragraph
                .set_field_from_string(Cow::Owned(name), Cow::Owned(value));
        }
    }
}

/// A streaming reader of [ControlParagraph].
///
/// Instances can be consumed as an iterator. Each call into the iterator reads
/// a full paragraph from the underlying reader. Invalid UTF-8 is replaced rather
/// than rejected, since index descriptions are not always well encoded.
pub struct ControlParagraphReader<R: BufRead> {
    reader: R,
    parser: Option<ControlFileParser>,
}

impl<R: BufRead> ControlParagraphReader<R> {
    /// Create a new instance bound to a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Some(ControlFileParser::default()),
        }
    }

    fn get_next(&mut self) -> Result<Option<ControlParagraph<'static>>> {
        let mut parser = match self.parser.take() {
            Some(parser) => parser,
            None => return Ok(None),
        };

        let mut buf = Vec::new();

        loop {
            buf.clear();

            if self.reader.read_until(b'\n', &mut buf)? == 0 {
                return Ok(parser.finish());
            }

            if let Some(paragraph) = parser.write_line(&String::from_utf8_lossy(&buf)) {
                self.parser.replace(parser);
                return Ok(Some(paragraph));
            }
        }
    }
}

impl<R: BufRead> Iterator for ControlParagraphReader<R> {
    type Item = Result<ControlParagraph<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.get_next() {
            Ok(Some(para)) => Some(Ok(para)),
            Ok(None) => None,
            Err(e) => {
                self.parser = None;
                Some(Err(e))
            }
        }
    }
}

/// Parse all paragraphs from a string.
pub fn parse_paragraphs(s: &str) -> Vec<ControlParagraph<'static>> {
    let mut parser = ControlFileParser::default();

    let mut paragraphs = s
        .lines()
        .filter_map(|line| parser.write_line(line))
        .collect::<Vec<_>>();

    paragraphs.extend(parser.finish());

    paragraphs
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    #[test]
    fn control_paragraph_field_semantics() {
        let mut p = ControlParagraph::default();

        // Same cased field name results in overwrite.
        p.set_field_from_string("foo".into(), "bar".into());
        p.set_field_from_string("foo".into(), "baz".into());
        assert_eq!(p.field_str("foo"), Some("baz"));

        // Different case results in overwrite.
        p.set_field_from_string("FOO".into(), "bar".into());
        assert_eq!(p.field_str("foo"), Some("bar"));
        assert_eq!(p.iter_fields().count(), 1);

        assert_eq!(p.field_str_or("Directory", ""), "");
    }

    #[test]
    fn parse_packages_stanzas() -> Result<()> {
        let data = indoc! {"
            Package: zstd
            Version: 1.4.8+dfsg-2.1
            Filename: pool/main/libz/libzstd/zstd_1.4.8+dfsg-2.1_amd64.deb
            Size: 503768
            Description: fast lossless compression algorithm -- CLI tool
             Zstd, short for Zstandard, is a fast lossless compression algorithm,
             targeting real-time compression scenarios.
            X-Custom:  keep me

            Package: zlib1g
            Filename: pool/main/z/zlib/zlib1g_1.2.11.dfsg-2_amd64.deb
            Size: 90980
        "};

        let paragraphs = ControlParagraphReader::new(std::io::Cursor::new(data.as_bytes()))
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(paragraphs.len(), 2);

        let p = &paragraphs[0];
        assert_eq!(p.field_str("Size"), Some("503768"));
        assert_eq!(
            p.field_str("Description"),
            Some(
                "fast lossless compression algorithm -- CLI tool\n \
                 Zstd, short for Zstandard, is a fast lossless compression algorithm,\n \
                 targeting real-time compression scenarios."
            )
        );
        assert_eq!(p.field_str("X-Custom"), Some("keep me"));
        assert_eq!(
            p.iter_fields().map(|f| f.name()).collect::<Vec<_>>(),
            vec!["Package", "Version", "Filename", "Size", "Description", "X-Custom"]
        );

        assert_eq!(paragraphs[1].field_str("Package"), Some("zlib1g"));

        Ok(())
    }

    #[test]
    fn continuation_lines_do_not_start_fields() {
        let paragraphs = parse_paragraphs(indoc! {"
            Files:
             d41d8cd98f00b204e9800998ecf8427e 0 empty.dsc
             0123456789abcdef0123456789abcdef 12 with: colon.tar.xz
        "});

        assert_eq!(paragraphs.len(), 1);
        assert_eq!(
            paragraphs[0]
                .field_iter_value_lines("Files")
                .unwrap()
                .collect::<Vec<_>>(),
            vec![
                "d41d8cd98f00b204e9800998ecf8427e 0 empty.dsc",
                "0123456789abcdef0123456789abcdef 12 with: colon.tar.xz",
            ]
        );
    }

    #[test]
    fn multiple_blank_lines_and_stray_lines() {
        let paragraphs = parse_paragraphs("\n\n stray\nA: 1\n\n\n\nB: 2\r\nC:3\n");

        assert_eq!(paragraphs.len(), 2);
        assert_eq!(paragraphs[0].field_str("A"), Some("1"));
        assert_eq!(paragraphs[1].field_str("B"), Some("2"));
        assert_eq!(paragraphs[1].field_str("C"), Some("3"));
    }

    #[test]
    fn invalid_utf8_is_replaced() -> Result<()> {
        let data = b"Package: caf\xe9\nSize: 1\n";

        let paragraphs = ControlParagraphReader::new(std::io::Cursor::new(&data[..]))
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(paragraphs.len(), 1);
        assert_eq!(paragraphs[0].field_str("Size"), Some("1"));

        Ok(())
    }
}
