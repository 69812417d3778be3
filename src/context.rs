/// Identity and course scope of one instructor request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub course_id: String,
    pub user_id: Option<String>,
    /// LTI 1.1 consumer key of the grading session, when the instructor arrived through LTI.
    pub consumer_key: Option<String>,
}

impl RequestContext {
    pub fn for_course(course_id: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            user_id: None,
            consumer_key: None,
        }
    }

    pub fn with_consumer_key(mut self, key: impl Into<String>) -> Self {
        self.consumer_key = Some(key.into());
        self
    }
}
