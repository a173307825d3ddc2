/// Result of an insert that tolerates a uniqueness conflict by returning the row that already
/// occupies the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateOrFind<T> {
    Created(T),
    Found(T),
}

impl<T> CreateOrFind<T> {
    pub fn is_created(&self) -> bool {
        matches!(self, CreateOrFind::Created(_))
    }

    pub fn get(&self) -> &T {
        match self {
            CreateOrFind::Created(t) | CreateOrFind::Found(t) => t,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            CreateOrFind::Created(t) | CreateOrFind::Found(t) => t,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> CreateOrFind<U> {
        match self {
            CreateOrFind::Created(t) => CreateOrFind::Created(f(t)),
            CreateOrFind::Found(t) => CreateOrFind::Found(f(t)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accessors_ignore_variant() {
        let created = CreateOrFind::Created(7);
        let found = CreateOrFind::Found(7);
        assert!(created.is_created());
        assert!(!found.is_created());
        assert_eq!(created.get(), found.get());
        assert_eq!(found.map(|v| v * 2).into_inner(), 14);
    }
}
