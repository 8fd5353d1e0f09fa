//! oVirt XML fault rendering.
//!
//! The façade API reports failures as `<fault>` documents.  Resource
//! bodies are built elsewhere; this module only covers the envelope the
//! gateway itself emits.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

/// Render an oVirt `<fault>` XML document.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8" standalone="yes"?>
/// <fault>
///   <reason>Operation Failed</reason>
///   <detail>CloudStack job failed: 530</detail>
/// </fault>
/// ```
pub fn render_fault(reason: &str, detail: &str) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))
        .expect("xml decl");

    write_simple_element_group(&mut writer, "fault", &[("reason", reason), ("detail", detail)]);

    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .expect("start tag");
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("text");
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .expect("end tag");
}

fn write_simple_element_group(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    parent: &str,
    children: &[(&str, &str)],
) {
    writer
        .write_event(Event::Start(BytesStart::new(parent)))
        .expect("start parent");
    for (tag, value) in children {
        write_text_element(writer, tag, value);
    }
    writer
        .write_event(Event::End(BytesEnd::new(parent)))
        .expect("end parent");
}
