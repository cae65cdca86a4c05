use crate::deadline::Deadline;

use super::{Fragment, Source, SourceError, Yield};

/// Adapter for inline raw text: the whole resource is one fragment.
#[derive(Debug)]
pub struct TextSource<'a> {
    /// The text carried in the request's `resource` field.
    pub text: &'a str,
}

impl Source for TextSource<'_> {
    fn kind(&self) -> &'static str {
        "Text"
    }

    fn fragments(&self, deadline: &Deadline, emit: Yield<'_>) -> Result<(), SourceError> {
        deadline.check()?;
        emit(Fragment {
            path: String::new(),
            text: self.text.to_string(),
            commit: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_the_raw_text_as_one_fragment() {
        let source = TextSource { text: "hello" };
        let mut fragments = Vec::new();
        source
            .fragments(&Deadline::none(), &mut |f| {
                fragments.push(f);
                Ok(())
            })
            .unwrap();

        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].text, "hello");
        assert!(fragments[0].path.is_empty());
    }
}
